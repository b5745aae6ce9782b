//! Actions that run element commands and move artifacts between caches.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use stratum_cache::LocalCache;
use stratum_core::{
    Action, ActionContext, ActionError, ActionKind, ActionOutput, ActionResult, ArtifactStore,
    CacheKey, ElementRef, Error, Result,
};
use tracing::info;

use crate::process::run_shell;

/// Commands and environment declared for one element, plus its cache key.
#[derive(Debug, Clone)]
pub struct ElementCommands {
    pub commands: BTreeMap<ActionKind, Vec<String>>,
    pub env: BTreeMap<String, String>,
    pub key: CacheKey,
}

impl ElementCommands {
    pub fn commands(&self, kind: ActionKind) -> &[String] {
        self.commands.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Commands for every element in a run.
#[derive(Debug, Clone, Default)]
pub struct CommandTable {
    elements: HashMap<ElementRef, ElementCommands>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an element. Its dependencies must already have been added, since
    /// their cache keys feed into this element's key.
    pub fn insert(
        &mut self,
        element: ElementRef,
        commands: BTreeMap<ActionKind, Vec<String>>,
        env: BTreeMap<String, String>,
        dependencies: &[ElementRef],
    ) -> Result<CacheKey> {
        let dep_keys = dependencies
            .iter()
            .map(|dep| {
                self.elements
                    .get(dep)
                    .map(|c| c.key.clone())
                    .ok_or_else(|| {
                        Error::InvalidPlan(format!(
                            "element '{}' added before its dependency '{}'",
                            element, dep
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut inputs: Vec<String> = commands
            .get(&ActionKind::Build)
            .cloned()
            .unwrap_or_default();
        inputs.extend(env.iter().map(|(k, v)| format!("{}={}", k, v)));
        let key = CacheKey::compute(&element, &inputs, &dep_keys);

        self.elements.insert(
            element,
            ElementCommands {
                commands,
                env,
                key: key.clone(),
            },
        );
        Ok(key)
    }

    pub fn get(&self, element: &ElementRef) -> std::result::Result<&ElementCommands, ActionError> {
        self.elements
            .get(element)
            .ok_or_else(|| ActionError::fatal(format!("no commands declared for '{}'", element)))
    }
}

/// Environment passed to every command.
fn command_env(
    element: &ElementRef,
    kind: ActionKind,
    commands: &ElementCommands,
) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = commands
        .env
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    env.push(("STRATUM_ELEMENT".to_string(), element.to_string()));
    env.push(("STRATUM_ACTION".to_string(), kind.to_string()));
    env.push(("STRATUM_CACHE_KEY".to_string(), commands.key.to_string()));
    env
}

/// Runs the element's commands for `kind` in the element's directory of
/// the workspace. Used for track and fetch.
pub struct ShellAction {
    kind: ActionKind,
    table: Arc<CommandTable>,
    workspace: PathBuf,
    /// Skip the commands when the element's artifact is already cached.
    cache: Option<LocalCache>,
}

impl ShellAction {
    pub fn new(kind: ActionKind, table: Arc<CommandTable>, workspace: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            table,
            workspace: workspace.into(),
            cache: None,
        }
    }

    pub fn skip_when_cached(mut self, cache: LocalCache) -> Self {
        self.cache = Some(cache);
        self
    }
}

#[async_trait]
impl Action for ShellAction {
    fn kind(&self) -> ActionKind {
        self.kind
    }

    async fn execute(&self, element: &ElementRef, ctx: &ActionContext) -> ActionResult {
        let commands = self.table.get(element)?;
        if let Some(cache) = &self.cache {
            if cache.contains(&commands.key).await? {
                return Ok(ActionOutput::empty().with_detail("artifact cached"));
            }
        }

        let scripts = commands.commands(self.kind);
        if scripts.is_empty() {
            return Ok(ActionOutput::empty().with_detail("nothing to do"));
        }

        let cwd = self.workspace.join(element.as_str());
        tokio::fs::create_dir_all(&cwd)
            .await
            .map_err(|e| ActionError::fatal(format!("create {}: {}", cwd.display(), e)))?;
        let env = command_env(element, self.kind, commands);

        let activity = match self.kind {
            ActionKind::Track => "Tracking",
            ActionKind::Fetch => "Fetching",
            _ => "Running",
        };
        ctx.timed_activity(activity, async {
            for script in scripts {
                run_shell(script, &cwd, &env, ctx).await?;
            }
            Ok(())
        })
        .await?;

        Ok(ActionOutput::empty())
    }
}

/// Builds an element into a staging directory and commits the result to
/// the local cache. Nothing is visible in the cache unless every command
/// succeeded.
pub struct BuildAction {
    table: Arc<CommandTable>,
    workspace: PathBuf,
    cache: LocalCache,
}

impl BuildAction {
    pub fn new(table: Arc<CommandTable>, workspace: impl Into<PathBuf>, cache: LocalCache) -> Self {
        Self {
            table,
            workspace: workspace.into(),
            cache,
        }
    }
}

#[async_trait]
impl Action for BuildAction {
    fn kind(&self) -> ActionKind {
        ActionKind::Build
    }

    async fn execute(&self, element: &ElementRef, ctx: &ActionContext) -> ActionResult {
        let commands = self.table.get(element)?;
        if let Some(artifact) = self.cache.get(&commands.key).await? {
            return Ok(ActionOutput::empty()
                .with_artifact(artifact)
                .with_detail("artifact cached"));
        }

        let cwd = self.workspace.join(element.as_str());
        tokio::fs::create_dir_all(&cwd)
            .await
            .map_err(|e| ActionError::fatal(format!("create {}: {}", cwd.display(), e)))?;

        let staged = self.cache.stage(&commands.key, element).await?;
        let mut env = command_env(element, ActionKind::Build, commands);
        env.push((
            "STRATUM_INSTALL_DIR".to_string(),
            staged.files_dir().display().to_string(),
        ));

        let scripts = commands.commands(ActionKind::Build);
        ctx.timed_activity("Building", async {
            for script in scripts {
                run_shell(script, &cwd, &env, ctx).await?;
            }
            Ok(())
        })
        .await?;

        let artifact = ctx
            .timed_activity("Caching artifact", async {
                self.cache.commit(staged).await.map_err(ActionError::from)
            })
            .await?;
        info!(element = %element, key = %artifact.key.short(), "Built artifact");
        Ok(ActionOutput::empty().with_artifact(artifact))
    }
}

/// Imports an element's artifact from a remote store into the local cache.
/// A miss is not an error: the build will produce the artifact instead.
pub struct PullAction {
    table: Arc<CommandTable>,
    local: LocalCache,
    remote: Arc<dyn ArtifactStore>,
}

impl PullAction {
    pub fn new(table: Arc<CommandTable>, local: LocalCache, remote: Arc<dyn ArtifactStore>) -> Self {
        Self {
            table,
            local,
            remote,
        }
    }
}

#[async_trait]
impl Action for PullAction {
    fn kind(&self) -> ActionKind {
        ActionKind::Pull
    }

    async fn execute(&self, element: &ElementRef, ctx: &ActionContext) -> ActionResult {
        let key = &self.table.get(element)?.key;
        if let Some(artifact) = self.local.get(key).await? {
            return Ok(ActionOutput::empty()
                .with_artifact(artifact)
                .with_detail("artifact cached"));
        }

        let Some(remote_artifact) = self.remote.get(key).await? else {
            return Ok(ActionOutput::empty().with_detail(format!(
                "artifact not found in {}",
                self.remote.name()
            )));
        };

        let artifact = ctx
            .timed_activity(format!("Pulling from {}", self.remote.name()), async {
                self.local
                    .import(&remote_artifact)
                    .await
                    .map_err(ActionError::from)
            })
            .await?;
        Ok(ActionOutput::empty()
            .with_artifact(artifact)
            .with_detail("pulled"))
    }
}

/// Exports an element's built artifact to a remote store.
pub struct PushAction {
    table: Arc<CommandTable>,
    local: LocalCache,
    remote: Arc<dyn ArtifactStore>,
}

impl PushAction {
    pub fn new(table: Arc<CommandTable>, local: LocalCache, remote: Arc<dyn ArtifactStore>) -> Self {
        Self {
            table,
            local,
            remote,
        }
    }
}

#[async_trait]
impl Action for PushAction {
    fn kind(&self) -> ActionKind {
        ActionKind::Push
    }

    async fn execute(&self, element: &ElementRef, ctx: &ActionContext) -> ActionResult {
        let key = &self.table.get(element)?.key;
        let artifact = self.local.get(key).await?.ok_or_else(|| {
            ActionError::fatal(format!("no artifact for '{}' in local cache", element))
        })?;

        if self.remote.contains(key).await? {
            return Ok(ActionOutput::empty()
                .with_artifact(artifact)
                .with_detail(format!("already present in {}", self.remote.name())));
        }

        let pushed = ctx
            .timed_activity(format!("Pushing to {}", self.remote.name()), async {
                self.remote.import(&artifact).await.map_err(ActionError::from)
            })
            .await?;
        Ok(ActionOutput::empty()
            .with_artifact(pushed)
            .with_detail("pushed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use stratum_core::{CancelReason, CancelScope, JobId, NullSink};
    use uuid::Uuid;

    struct Fixture {
        root: PathBuf,
        table: Arc<CommandTable>,
        local: LocalCache,
        remote: LocalCache,
    }

    impl Fixture {
        async fn new(build: &[&str]) -> Self {
            let root = std::env::temp_dir().join(format!("stratum-command-test-{}", Uuid::new_v4()));
            let local = LocalCache::open("local", root.join("local")).await.unwrap();
            let remote = LocalCache::open("remote", root.join("remote")).await.unwrap();

            let mut table = CommandTable::new();
            let commands = BTreeMap::from([(
                ActionKind::Build,
                build.iter().map(|s| s.to_string()).collect(),
            )]);
            table
                .insert(ElementRef::new("base"), commands, BTreeMap::new(), &[])
                .unwrap();

            Self {
                root,
                table: Arc::new(table),
                local,
                remote,
            }
        }

        fn build_action(&self) -> BuildAction {
            BuildAction::new(self.table.clone(), self.root.join("work"), self.local.clone())
        }

        fn key(&self) -> CacheKey {
            self.table.get(&ElementRef::new("base")).unwrap().key.clone()
        }

        async fn cleanup(self) {
            tokio::fs::remove_dir_all(self.root).await.unwrap();
        }
    }

    fn context(scope: CancelScope, kind: ActionKind) -> ActionContext {
        ActionContext::new(
            JobId::new(0),
            ElementRef::new("base"),
            kind,
            1,
            scope,
            Arc::new(NullSink),
        )
    }

    #[test]
    fn test_table_requires_dependency_order() {
        let mut table = CommandTable::new();
        let result = table.insert(
            ElementRef::new("app"),
            BTreeMap::new(),
            BTreeMap::new(),
            &[ElementRef::new("base")],
        );
        assert!(matches!(result, Err(Error::InvalidPlan(_))));
    }

    #[test]
    fn test_key_changes_with_dependency() {
        let mut a = CommandTable::new();
        a.insert(ElementRef::new("base"), BTreeMap::new(), BTreeMap::new(), &[])
            .unwrap();
        let app_a = a
            .insert(ElementRef::new("app"), BTreeMap::new(), BTreeMap::new(), &[ElementRef::new("base")])
            .unwrap();

        let mut b = CommandTable::new();
        b.insert(
            ElementRef::new("base"),
            BTreeMap::from([(ActionKind::Build, vec!["make".to_string()])]),
            BTreeMap::new(),
            &[],
        )
        .unwrap();
        let app_b = b
            .insert(ElementRef::new("app"), BTreeMap::new(), BTreeMap::new(), &[ElementRef::new("base")])
            .unwrap();

        assert_ne!(app_a, app_b);
    }

    #[tokio::test]
    async fn test_build_commits_artifact() {
        let fixture = Fixture::new(&["echo built > $STRATUM_INSTALL_DIR/out.txt"]).await;
        let action = fixture.build_action();
        let ctx = context(CancelScope::new(), ActionKind::Build);

        let output = action.execute(&ElementRef::new("base"), &ctx).await.unwrap();
        let artifact = output.artifact.unwrap();
        assert_eq!(artifact.key, fixture.key());
        assert!(fixture.local.contains(&fixture.key()).await.unwrap());

        // A second build is served from the cache.
        let again = action.execute(&ElementRef::new("base"), &ctx).await.unwrap();
        assert_eq!(again.detail.as_deref(), Some("artifact cached"));

        fixture.cleanup().await;
    }

    #[tokio::test]
    async fn test_failed_build_leaves_cache_untouched() {
        let fixture = Fixture::new(&["echo half > $STRATUM_INSTALL_DIR/out.txt", "exit 1"]).await;
        let action = fixture.build_action();
        let ctx = context(CancelScope::new(), ActionKind::Build);

        assert!(action.execute(&ElementRef::new("base"), &ctx).await.is_err());
        assert!(!fixture.local.contains(&fixture.key()).await.unwrap());

        fixture.cleanup().await;
    }

    #[tokio::test]
    async fn test_cancelled_build_leaves_no_partial_artifact() {
        let fixture = Fixture::new(&["echo half > $STRATUM_INSTALL_DIR/out.txt; sleep 30"]).await;
        let action = fixture.build_action();
        let scope = CancelScope::new();
        let ctx = context(scope.clone(), ActionKind::Build);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            scope.cancel(CancelReason::UserInterrupt);
        });

        assert!(action.execute(&ElementRef::new("base"), &ctx).await.is_err());
        assert!(!fixture.local.contains(&fixture.key()).await.unwrap());
        let mut staging = tokio::fs::read_dir(fixture.root.join("local").join("tmp"))
            .await
            .unwrap();
        assert!(staging.next_entry().await.unwrap().is_none());

        fixture.cleanup().await;
    }

    #[tokio::test]
    async fn test_push_then_pull() {
        let fixture = Fixture::new(&["echo built > $STRATUM_INSTALL_DIR/out.txt"]).await;
        let remote: Arc<dyn ArtifactStore> = Arc::new(fixture.remote.clone());
        let element = ElementRef::new("base");

        fixture
            .build_action()
            .execute(&element, &context(CancelScope::new(), ActionKind::Build))
            .await
            .unwrap();

        let push = PushAction::new(fixture.table.clone(), fixture.local.clone(), remote.clone());
        let pushed = push
            .execute(&element, &context(CancelScope::new(), ActionKind::Push))
            .await
            .unwrap();
        assert_eq!(pushed.detail.as_deref(), Some("pushed"));
        assert!(fixture.remote.contains(&fixture.key()).await.unwrap());

        // Pull into a fresh local cache.
        let fresh = LocalCache::open("fresh", fixture.root.join("fresh")).await.unwrap();
        let pull = PullAction::new(fixture.table.clone(), fresh.clone(), remote);
        let pulled = pull
            .execute(&element, &context(CancelScope::new(), ActionKind::Pull))
            .await
            .unwrap();
        assert_eq!(pulled.detail.as_deref(), Some("pulled"));
        assert!(fresh.contains(&fixture.key()).await.unwrap());

        fixture.cleanup().await;
    }

    #[tokio::test]
    async fn test_pull_miss_is_not_an_error() {
        let fixture = Fixture::new(&["true"]).await;
        let remote: Arc<dyn ArtifactStore> = Arc::new(fixture.remote.clone());
        let pull = PullAction::new(fixture.table.clone(), fixture.local.clone(), remote);

        let output = pull
            .execute(&ElementRef::new("base"), &context(CancelScope::new(), ActionKind::Pull))
            .await
            .unwrap();
        assert!(output.artifact.is_none());

        fixture.cleanup().await;
    }

    #[tokio::test]
    async fn test_shell_action_without_commands_is_noop() {
        let fixture = Fixture::new(&["true"]).await;
        let fetch = ShellAction::new(ActionKind::Fetch, fixture.table.clone(), fixture.root.join("work"));
        let output = fetch
            .execute(&ElementRef::new("base"), &context(CancelScope::new(), ActionKind::Fetch))
            .await
            .unwrap();
        assert_eq!(output.detail.as_deref(), Some("nothing to do"));

        fixture.cleanup().await;
    }
}
