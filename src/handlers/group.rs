use super::*;

#[async_trait]
impl Reconcile for Group {
    const FINALIZER: Option<&'static str> = Some("kanidm.github.io/group-finalizer");

    async fn apply(&self, ctx: &Context) -> Result<(), Error> {
        let spec = &self.spec;
        check_identity("group", self.status.as_ref(), &spec.name, &spec.kanidm_name)?;

        tracing::info!(
            { group = &spec.name, kanidm = &spec.kanidm_name, members = spec.members.len() },
            "reconciling group"
        );

        let directory = ctx
            .directory(&spec.kanidm_name, &self.namespace_any(), MissingInstance::Fail)
            .await?;
        directory.create_group(&spec.name).await?;
        directory.set_group_members(&spec.name, &spec.members).await?;

        record_identity(ctx, self, &spec.name, &spec.kanidm_name).await
    }

    async fn cleanup(&self, ctx: &Context) -> Result<(), Error> {
        let (name, kanidm_name) =
            applied_identity(self.status.as_ref(), &self.spec.name, &self.spec.kanidm_name);

        let directory = ctx
            .directory(kanidm_name, &self.namespace_any(), MissingInstance::Ignore)
            .await?;
        if !directory.is_connected() {
            tracing::info!({ group = name, kanidm = kanidm_name }, "instance is gone, nothing to delete");
            return Ok(());
        }

        directory.delete_group(name).await
    }
}
