//! Snakemake backend.
//!
//! Lowers a compiled pipeline graph into a Snakefile and launches the
//! `snakemake` runner on it. Each rule touches a completion marker and lists
//! its graph predecessors' markers as `upstream` inputs, so every graph edge
//! is a real dependency for the runner even when no data path connects the
//! two nodes.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use minijinja::Environment;
use multiact_types::config::BackendConfig;
use multiact_types::node::{validate_name, ContainerSpec, Node, NodeKind, PathMap};
use serde::Serialize;
use tokio::sync::Mutex;

use super::mount::{FuseMounter, Location, MountGuard, Mounter};
use super::process::{NixSignaller, RunHandle, SignalSender};
use super::template::{SNAKEFILE_TEMPLATE, SNAKEFILE_TEMPLATE_NAME};
use super::{Backend, BackendError};
use crate::config::load_backend_config;
use crate::pipeline::{Pipeline, PipelineError};

/// Directory, relative to the working directory, holding completion markers.
pub const MARKER_DIR: &str = ".multiact/markers";

/// Path keys the template already uses for its own inputs and outputs.
const RESERVED_PATH_KEYS: &[&str] = &["upstream", "marker"];

/// Rule names the template defines itself.
const RESERVED_RULE_NAMES: &[&str] = &["all"];

// ---------------------------------------------------------------------------
// RunnerCommand
// ---------------------------------------------------------------------------

/// The program and arguments a run spawns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerCommand {
    pub program: String,
    pub args: Vec<String>,
}

// ---------------------------------------------------------------------------
// SnakemakeBackend
// ---------------------------------------------------------------------------

pub struct SnakemakeBackend<M: Mounter = FuseMounter> {
    pipeline: Arc<Pipeline>,
    config: BackendConfig,
    output_dir: Location,
    scratch_dir: PathBuf,
    mounter: Arc<M>,
    signaller: Arc<dyn SignalSender>,
    /// Held from mount until unmount, one remote run at a time.
    mount_lock: Arc<Mutex<()>>,
    /// Set by the last successful `compile()`.
    workflow_file: Option<PathBuf>,
}

impl SnakemakeBackend {
    /// `output_dir` is a local path or a remote URI such as `gs://bucket/prefix`.
    /// `scratch_dir` holds the mount point and staged files for remote output.
    pub fn new(
        pipeline: Arc<Pipeline>,
        config: BackendConfig,
        output_dir: &str,
        scratch_dir: impl Into<PathBuf>,
    ) -> Result<Self, BackendError> {
        Ok(Self {
            pipeline,
            config,
            output_dir: Location::parse(output_dir)?,
            scratch_dir: scratch_dir.into(),
            mounter: Arc::new(FuseMounter),
            signaller: Arc::new(NixSignaller),
            mount_lock: Arc::new(Mutex::new(())),
            workflow_file: None,
        })
    }

    /// Like `new`, with the configuration read from `multiact.toml` in
    /// `config_dir` (defaults when missing or malformed).
    pub async fn from_config_dir(
        pipeline: Arc<Pipeline>,
        config_dir: &Path,
        output_dir: &str,
        scratch_dir: impl Into<PathBuf>,
    ) -> Result<Self, BackendError> {
        let config = load_backend_config(config_dir).await;
        Self::new(pipeline, config, output_dir, scratch_dir)
    }
}

impl<M: Mounter> SnakemakeBackend<M> {
    pub fn with_mounter<N: Mounter>(self, mounter: Arc<N>) -> SnakemakeBackend<N> {
        SnakemakeBackend {
            pipeline: self.pipeline,
            config: self.config,
            output_dir: self.output_dir,
            scratch_dir: self.scratch_dir,
            mounter,
            signaller: self.signaller,
            mount_lock: self.mount_lock,
            workflow_file: self.workflow_file,
        }
    }

    pub fn with_signaller(mut self, signaller: Arc<dyn SignalSender>) -> Self {
        self.signaller = signaller;
        self
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn output_dir(&self) -> &Location {
        &self.output_dir
    }

    /// Path of the last rendered workflow file, if any.
    pub fn workflow_file(&self) -> Option<&Path> {
        self.workflow_file.as_deref()
    }

    /// Directory the runner executes in: the output directory itself, or the
    /// mount point for remote output.
    pub fn workdir(&self) -> PathBuf {
        match &self.output_dir {
            Location::Local(dir) => dir.clone(),
            Location::Remote(_) => self.mount_point(),
        }
    }

    fn mount_point(&self) -> PathBuf {
        self.scratch_dir.join("mount")
    }

    /// Where `compile()` writes. Remote output is staged locally and copied
    /// into the mount at launch.
    fn staging_dir(&self) -> PathBuf {
        match &self.output_dir {
            Location::Local(dir) => dir.clone(),
            Location::Remote(_) => self.scratch_dir.join("staging"),
        }
    }

    /// Build the runner invocation from the configuration.
    pub fn command_line(&self) -> RunnerCommand {
        let mut argv = Vec::new();
        if self.config.background {
            argv.push("nohup".to_string());
        }
        argv.push(self.config.runner.clone());
        argv.push("--snakefile".to_string());
        argv.push(self.config.workflow_file_name.clone());
        argv.push("--cores".to_string());
        argv.push(self.config.effective_cores().to_string());
        if self.config.force_run {
            argv.push("--forceall".to_string());
        }
        if self.config.use_singularity {
            argv.push("--use-singularity".to_string());
        }
        if self.config.print_commands {
            argv.push("--printshellcmds".to_string());
        }

        if let Some(shipper) = &self.config.log_shipper {
            let line = argv.iter().map(|a| shell_quote(a)).collect::<Vec<_>>().join(" ");
            return RunnerCommand {
                program: "sh".to_string(),
                args: vec!["-c".to_string(), format!("{line} 2>&1 | {shipper}")],
            };
        }

        let program = argv.remove(0);
        RunnerCommand { program, args: argv }
    }

    // -- rendering ----------------------------------------------------------

    fn render(&self) -> Result<String, BackendError> {
        let graph = self.pipeline.compile()?;
        let order = graph.topological_order()?;

        let mut ctx = SnakefileContext {
            pipeline: self.pipeline.name().to_string(),
            ..Default::default()
        };
        let mut rule_names: HashSet<String> =
            RESERVED_RULE_NAMES.iter().map(|n| n.to_string()).collect();

        for node in &order {
            let upstream: Vec<String> = graph
                .predecessors(node)
                .into_iter()
                .map(|p| marker_literal(p.name()))
                .collect();

            match node.kind() {
                NodeKind::Container(spec) => {
                    claim_rule_name(&mut rule_names, node.name())?;
                    ctx.containers.push(self.container_rule(node, spec, upstream)?);
                }
                NodeKind::ParContainer { template, .. } => {
                    let mut unit_markers = Vec::new();
                    for unit in node.expand_units() {
                        claim_rule_name(&mut rule_names, unit.name())?;
                        unit_markers.push(marker_literal(unit.name()));
                        ctx.containers
                            .push(self.container_rule(&unit, template, upstream.clone())?);
                    }
                    let group_upstream = if unit_markers.is_empty() {
                        upstream
                    } else {
                        unit_markers
                    };
                    claim_rule_name(&mut rule_names, node.name())?;
                    ctx.markers
                        .push(self.marker_rule(node, "par_container group", group_upstream));
                }
                NodeKind::PureFunction { function, params } => {
                    claim_rule_name(&mut rule_names, node.name())?;
                    let params = serde_json::Value::Object(
                        params.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                    );
                    let mut rule = self.base_rule(node, upstream)?;
                    rule.function = Some(py_literal(function));
                    rule.params = Some(py_literal(&params.to_string()));
                    ctx.functions.push(rule);
                }
                NodeKind::Shell { command } => {
                    claim_rule_name(&mut rule_names, node.name())?;
                    let mut rule = self.base_rule(node, upstream)?;
                    rule.shell = Some(py_literal(command));
                    ctx.shells.push(rule);
                }
                NodeKind::Scatter => {
                    claim_rule_name(&mut rule_names, node.name())?;
                    ctx.markers.push(self.marker_rule(node, "scatter", upstream));
                }
                NodeKind::Gather => {
                    claim_rule_name(&mut rule_names, node.name())?;
                    ctx.markers.push(self.marker_rule(node, "gather", upstream));
                }
                NodeKind::Custom { kind, .. } => {
                    return Err(BackendError::UnsupportedNodeKind {
                        node: node.name().to_string(),
                        kind: kind.clone(),
                    });
                }
            }
        }

        ctx.targets = graph
            .sinks()
            .into_iter()
            .map(|n| marker_literal(n.name()))
            .collect();

        tracing::debug!(
            pipeline = %ctx.pipeline,
            containers = ctx.containers.len(),
            functions = ctx.functions.len(),
            shells = ctx.shells.len(),
            markers = ctx.markers.len(),
            targets = ctx.targets.len(),
            "rendering snakefile"
        );

        let mut env = Environment::new();
        env.add_template(SNAKEFILE_TEMPLATE_NAME, SNAKEFILE_TEMPLATE)?;
        let template = env.get_template(SNAKEFILE_TEMPLATE_NAME)?;
        Ok(template.render(&ctx)?)
    }

    fn base_rule(&self, node: &Node, upstream: Vec<String>) -> Result<RuleContext, BackendError> {
        Ok(RuleContext {
            name: node.name().to_string(),
            inputs: self.path_groups(node, node.input_paths())?,
            outputs: self.path_groups(node, node.output_paths())?,
            upstream,
            marker: marker_literal(node.name()),
            ..Default::default()
        })
    }

    fn container_rule(
        &self,
        node: &Node,
        spec: &ContainerSpec,
        upstream: Vec<String>,
    ) -> Result<RuleContext, BackendError> {
        let image = if spec.image.contains("://") {
            spec.image.clone()
        } else {
            format!("docker://{}", spec.image)
        };
        let shell = spec
            .env
            .iter()
            .map(|(k, v)| format!("{k}={}", shell_quote(v)))
            .chain(spec.command.iter().map(|arg| shell_quote(arg)))
            .collect::<Vec<_>>()
            .join(" ");

        let mut rule = self.base_rule(node, upstream)?;
        rule.image = Some(py_literal(&image));
        rule.shell = Some(py_literal(&shell));
        Ok(rule)
    }

    /// Marker rules only join. A par-container group leaves its paths to the
    /// instance rules, which are the ones producing them.
    fn marker_rule(&self, node: &Node, role: &str, upstream: Vec<String>) -> RuleContext {
        RuleContext {
            name: node.name().to_string(),
            upstream,
            marker: marker_literal(node.name()),
            role: Some(role.to_string()),
            ..Default::default()
        }
    }

    fn path_groups(&self, node: &Node, paths: &PathMap) -> Result<Vec<PathGroup>, BackendError> {
        paths
            .iter()
            .map(|(key, values)| {
                if validate_name(key).is_err() || RESERVED_PATH_KEYS.contains(&key.as_str()) {
                    return Err(BackendError::InvalidPathKey {
                        node: node.name().to_string(),
                        key: key.clone(),
                    });
                }
                Ok(PathGroup {
                    name: key.clone(),
                    paths: values.iter().map(|p| py_literal(&self.localize(p))).collect(),
                })
            })
            .collect()
    }

    fn localize(&self, path: &str) -> String {
        match &self.output_dir {
            Location::Local(_) => path.to_string(),
            Location::Remote(remote) => remote.localize(path, &self.mount_point()),
        }
    }
}

impl<M: Mounter> Backend for SnakemakeBackend<M> {
    fn compile(&mut self) -> Result<PathBuf, BackendError> {
        let rendered = self.render()?;
        let path = self.staging_dir().join(&self.config.workflow_file_name);
        write_atomically(&path, &rendered)?;

        tracing::info!(
            pipeline = %self.pipeline.name(),
            path = %path.display(),
            "wrote workflow file"
        );
        self.workflow_file = Some(path.clone());
        Ok(path)
    }

    async fn run(&mut self) -> Result<RunHandle, BackendError> {
        let staged = match &self.workflow_file {
            Some(path) => path.clone(),
            None => self.compile()?,
        };

        let mount = match &self.output_dir {
            Location::Local(dir) => {
                tokio::fs::create_dir_all(dir).await?;
                None
            }
            Location::Remote(remote) => {
                let mount_point = self.mount_point();
                let lease = Arc::clone(&self.mount_lock)
                    .try_lock_owned()
                    .map_err(|_| BackendError::MountInUse(mount_point.display().to_string()))?;
                let guard = MountGuard::acquire(Arc::clone(&self.mounter), remote, &mount_point)
                    .await?
                    .with_lease(lease);
                tokio::fs::copy(
                    &staged,
                    guard.mount_point().join(&self.config.workflow_file_name),
                )
                .await?;
                Some(guard)
            }
        };

        let workdir = self.workdir();
        let log_path = workdir.join(&self.config.log_file_name);
        let log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await?
            .into_std()
            .await;
        let log_err = log.try_clone()?;

        let command = self.command_line();
        tracing::info!(
            program = %command.program,
            args = ?command.args,
            workdir = %workdir.display(),
            "launching runner"
        );

        let spawned = {
            let mut cmd = tokio::process::Command::new(&command.program);
            cmd.args(&command.args)
                .current_dir(&workdir)
                .stdin(Stdio::null())
                .stdout(Stdio::from(log))
                .stderr(Stdio::from(log_err));
            #[cfg(unix)]
            cmd.process_group(0);
            cmd.spawn()
        };

        match spawned {
            Ok(child) => RunHandle::start(child, log_path, Arc::clone(&self.signaller), mount),
            Err(e) => {
                if let Some(guard) = mount {
                    if let Err(unmount_err) = guard.release().await {
                        tracing::warn!(error = %unmount_err, "failed to unmount after failed launch");
                    }
                }
                Err(if e.kind() == std::io::ErrorKind::NotFound {
                    BackendError::Launch(format!("runner '{}' not found", command.program))
                } else {
                    BackendError::Launch(format!("failed to spawn '{}': {e}", command.program))
                })
            }
        }
    }
}

impl<M: Mounter> std::fmt::Debug for SnakemakeBackend<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnakemakeBackend")
            .field("pipeline", &self.pipeline.name())
            .field("config", &self.config)
            .field("output_dir", &self.output_dir)
            .field("scratch_dir", &self.scratch_dir)
            .field("workflow_file", &self.workflow_file)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Template context
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Serialize)]
struct SnakefileContext {
    pipeline: String,
    targets: Vec<String>,
    containers: Vec<RuleContext>,
    functions: Vec<RuleContext>,
    shells: Vec<RuleContext>,
    markers: Vec<RuleContext>,
}

/// One rule. String fields holding paths or commands are Python literals.
#[derive(Debug, Default, Serialize)]
struct RuleContext {
    name: String,
    inputs: Vec<PathGroup>,
    outputs: Vec<PathGroup>,
    upstream: Vec<String>,
    marker: String,
    image: Option<String>,
    shell: Option<String>,
    function: Option<String>,
    params: Option<String>,
    role: Option<String>,
}

#[derive(Debug, Serialize)]
struct PathGroup {
    name: String,
    paths: Vec<String>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn claim_rule_name(names: &mut HashSet<String>, name: &str) -> Result<(), BackendError> {
    if names.insert(name.to_string()) {
        Ok(())
    } else {
        Err(PipelineError::DuplicateNodeName(name.to_string()).into())
    }
}

fn marker_path(name: &str) -> String {
    format!("{MARKER_DIR}/{name}.done")
}

fn marker_literal(name: &str) -> String {
    py_literal(&marker_path(name))
}

/// Double-quoted string literal. JSON escapes are valid Python escapes.
fn py_literal(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}

/// Quote `arg` for a POSIX shell when it contains anything unusual. Braces
/// pass through so Snakemake placeholders like `{input.image}` still expand.
fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,{}".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

fn write_atomically(path: &Path, contents: &str) -> Result<(), BackendError> {
    let dir = path.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents.as_bytes())?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
