use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::{info, info_span};

use crate::alerts::{self, Alert, AlertType};
use crate::cache::Cache;
use crate::config::{
    self, CliArgs, Command, OutputFormat, ProfileConfig, SC_DIR, SecureArgs, StackArgs,
};
use crate::descriptor::StackDescriptor;
use crate::error::{DeployerError, Result};
use crate::exec::ProcessRunner;
use crate::graph::{self, StackMap};
use crate::image::ImageRef;
use crate::loader::load_stacks;
use crate::prepare::{DeployOverrides, prepare_deploy};
use crate::provisioner::DeployParams;
use crate::registry::Registry;
use crate::security::{SecurityConfig, SecurityExecutor};
use crate::tools::ToolRegistry;

/// CLI entry point: dispatches subcommands onto the pipeline.
pub async fn run(cli: CliArgs) -> Result<()> {
    match cli.command {
        Command::Provision(args) => provision(args).await,
        Command::Deploy(args) => deploy(args).await,
        Command::Validate(args) => validate(args).await,
        Command::Secure(args) => secure(args).await,
    }
}

struct LoadedWorkspace {
    profile: ProfileConfig,
    registry: Arc<Registry>,
    stacks: StackMap,
    stacks_dir: std::path::PathBuf,
}

fn load_workspace(args: &StackArgs) -> Result<LoadedWorkspace> {
    let profile = ProfileConfig::load(&args.workdir, &args.profile)?;
    let registry = Arc::new(Registry::with_default_providers());
    let stacks_dir = profile.stacks_dir(&args.workdir);
    let mut stacks = load_stacks(&stacks_dir, &registry)?;
    graph::resolve_inheritance(&mut stacks)?;
    graph::validate(&stacks)?;
    Ok(LoadedWorkspace {
        profile,
        registry,
        stacks,
        stacks_dir,
    })
}

async fn provision(args: StackArgs) -> Result<()> {
    let span = info_span!("provision", stack = %args.stack, environment = %args.environment);
    let _enter = span.enter();

    let workspace = load_workspace(&args)?;
    let stack = workspace
        .stacks
        .get(&args.stack)
        .ok_or_else(|| DeployerError::UnknownStack(args.stack.clone()))?;
    let node = stack.server.provisioner.as_ref().ok_or_else(|| {
        DeployerError::Config(format!("stack '{}' declares no provisioner", args.stack))
    })?;

    let factory = workspace
        .registry
        .provisioner_factory(&node.kind, &format!("{}.provisioner", args.stack))?;
    let mut provisioner = factory(node)?;
    if let Some(key) = workspace.profile.public_key_material()? {
        provisioner.set_public_key(key);
    }
    provisioner.set_config_reader(workspace.registry.kind_reader());

    if args.preview {
        println!("Preview mode: provisioning skipped for stack '{}'.", args.stack);
        return Ok(());
    }
    provisioner
        .provision_stack(&workspace.profile, stack)
        .await?;
    info!(stack = %args.stack, "stack provisioned");
    Ok(())
}

async fn deploy(args: StackArgs) -> Result<()> {
    let span = info_span!("deploy", stack = %args.stack, environment = %args.environment);
    let _enter = span.enter();

    let workspace = load_workspace(&args)?;
    let senders = alerts::senders_from_env();
    alerts::broadcast(
        &senders,
        &Alert::build_event(
            AlertType::BuildStarted,
            &args.stack,
            &args.environment,
            "deploy started",
        ),
    )
    .await;

    let outcome = deploy_inner(&args, &workspace).await;
    let (alert_type, reason) = match &outcome {
        Ok(()) => (AlertType::BuildSucceeded, "deploy succeeded".to_string()),
        Err(DeployerError::Cancelled(op)) => {
            (AlertType::BuildCancelled, format!("deploy cancelled: {op}"))
        }
        Err(err) => (AlertType::BuildFailed, format!("deploy failed: {err}")),
    };
    alerts::broadcast(
        &senders,
        &Alert::build_event(alert_type, &args.stack, &args.environment, &reason),
    )
    .await;
    outcome
}

async fn deploy_inner(args: &StackArgs, workspace: &LoadedWorkspace) -> Result<()> {
    let overrides = DeployOverrides::new();
    let mut descriptor = prepare_deploy(
        &workspace.stacks,
        &workspace.registry,
        &workspace.stacks_dir,
        &args.stack,
        &args.environment,
        &overrides,
    )?;
    inject_workload_context(&mut descriptor, &args.stack, &args.environment, args.version.as_deref());

    if args.preview {
        render(&args.output, &descriptor)?;
        println!("Preview mode: nothing was deployed.");
        return Ok(());
    }

    let factory = workspace.registry.provisioner_factory(
        &provisioner_kind(workspace, &descriptor)?,
        &format!("{}.provisioner", args.stack),
    )?;
    let parent = workspace
        .stacks
        .get(graph::parent_stack_key(&descriptor.parent_stack))
        .ok_or_else(|| DeployerError::UnknownStack(descriptor.parent_stack.clone()))?;
    let node = parent.server.provisioner.as_ref().ok_or_else(|| {
        DeployerError::Config(format!(
            "parent stack '{}' declares no provisioner",
            parent.name
        ))
    })?;
    let mut provisioner = factory(node)?;
    if let Some(key) = workspace.profile.public_key_material()? {
        provisioner.set_public_key(key);
    }
    provisioner.set_config_reader(workspace.registry.kind_reader());

    let params = DeployParams {
        environment: args.environment.clone(),
        version: args.version.clone(),
        preview: false,
    };
    provisioner
        .deploy_stack(&workspace.profile, &descriptor, &params)
        .await?;
    info!(stack = %args.stack, environment = %args.environment, "stack deployed");
    Ok(())
}

fn provisioner_kind(workspace: &LoadedWorkspace, descriptor: &StackDescriptor) -> Result<String> {
    let parent = workspace
        .stacks
        .get(graph::parent_stack_key(&descriptor.parent_stack))
        .ok_or_else(|| DeployerError::UnknownStack(descriptor.parent_stack.clone()))?;
    Ok(parent
        .server
        .provisioner
        .as_ref()
        .map(|node| node.kind.clone())
        .unwrap_or_default())
}

async fn validate(args: StackArgs) -> Result<()> {
    let workspace = load_workspace(&args)?;
    let overrides = DeployOverrides::new();
    let descriptor = prepare_deploy(
        &workspace.stacks,
        &workspace.registry,
        &workspace.stacks_dir,
        &args.stack,
        &args.environment,
        &overrides,
    )?;
    println!(
        "Stack '{}' environment '{}' is valid (type {}).",
        args.stack, args.environment, descriptor.stack_type
    );
    Ok(())
}

async fn secure(args: SecureArgs) -> Result<()> {
    let span = info_span!("secure", image = %args.image);
    let _enter = span.enter();

    let image = ImageRef::parse(&args.image)?;
    let config = SecurityConfig::load(&args.config)?;
    let tools = ToolRegistry::builtin();
    let cache = Cache::new(args.workdir.join(SC_DIR).join("cache"));
    let runner = ProcessRunner;

    let executor = SecurityExecutor::new(&tools, &runner, &cache, &config);
    let summary = executor.execute(&image).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

/// Injects the workload context variables into every service of the
/// prepared descriptor.
fn inject_workload_context(
    descriptor: &mut StackDescriptor,
    stack: &str,
    environment: &str,
    version: Option<&str>,
) {
    let stack_type = descriptor.stack_type.clone();
    let Some(services) = descriptor
        .config
        .get_mut("services")
        .and_then(JsonValue::as_array_mut)
    else {
        return;
    };
    for service in services {
        let Some(env) = service.get_mut("env").and_then(JsonValue::as_object_mut) else {
            continue;
        };
        env.insert(
            config::ENV_RESOURCE_TYPE.to_string(),
            JsonValue::String(stack_type.clone()),
        );
        env.insert(config::ENV_STACK.to_string(), JsonValue::String(stack.to_string()));
        env.insert(
            config::ENV_ENVIRONMENT.to_string(),
            JsonValue::String(environment.to_string()),
        );
        if let Some(version) = version {
            env.insert(
                config::ENV_VERSION.to_string(),
                JsonValue::String(version.to_string()),
            );
        }
    }
}

fn render<T: serde::Serialize>(format: &OutputFormat, value: &T) -> Result<()> {
    match format {
        OutputFormat::Text | OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(value)?);
        }
        OutputFormat::Yaml => {
            let yaml = serde_yaml_bw::to_string(value)
                .map_err(|err| DeployerError::Other(err.to_string()))?;
            println!("{yaml}");
        }
    }
    Ok(())
}
