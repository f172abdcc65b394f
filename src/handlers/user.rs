use super::*;

#[async_trait]
impl Reconcile for User {
    const FINALIZER: Option<&'static str> = Some("kanidm.github.io/user-finalizer");

    async fn apply(&self, ctx: &Context) -> Result<(), Error> {
        let spec = &self.spec;
        let namespace = self.namespace_any();
        check_identity("user", self.status.as_ref(), &spec.name, &spec.kanidm_name)?;

        tracing::info!({ user = &spec.name, kanidm = &spec.kanidm_name }, "reconciling user");

        let directory = ctx
            .directory(&spec.kanidm_name, &namespace, MissingInstance::Fail)
            .await?;
        directory.create_person(&spec.name, &spec.display_name).await?;
        directory.set_person_emails(&spec.name, &spec.emails).await?;

        record_identity(ctx, self, &spec.name, &spec.kanidm_name).await
    }

    async fn cleanup(&self, ctx: &Context) -> Result<(), Error> {
        let (name, kanidm_name) =
            applied_identity(self.status.as_ref(), &self.spec.name, &self.spec.kanidm_name);

        let directory = ctx
            .directory(kanidm_name, &self.namespace_any(), MissingInstance::Ignore)
            .await?;
        if !directory.is_connected() {
            tracing::info!({ user = name, kanidm = kanidm_name }, "instance is gone, nothing to delete");
            return Ok(());
        }

        directory.delete_person(name).await
    }
}
