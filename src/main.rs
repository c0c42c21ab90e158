//! shim-runtime CLI entry point.
//!
//! Registers scripted backends (from a TOML config or a built-in default set)
//! and resolves runtimes against them.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shim_runtime_backends::{ImageInfo, LoggingFactory, ScriptedFactory};
use shim_runtime_common::{
    BackendEntry, CapabilitySet, CapabilityValue, ConfigFile, InitBehavior, RuntimeConfig,
    RuntimeKind, caps,
};
use shim_runtime_core::{EventTarget, RuntimeClient, RuntimePool, RuntimeRequest, events};

#[derive(Debug, Parser)]
#[command(name = "shim-runtime", version, about = "Capability-driven runtime selection")]
struct Cli {
    /// TOML configuration file. Defaults to four scripted backends.
    #[arg(short, long, env = "SHIM_RUNTIME_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List registered backends in priority order.
    Backends,

    /// Resolve a runtime for a capability set.
    Resolve {
        /// Required capability.
        #[arg(long = "require", value_name = "NAME=VALUE", value_parser = parse_capability)]
        require: Vec<(String, CapabilityValue)>,

        /// Optional capability; only distinguishes runtime configurations.
        #[arg(long = "optional", value_name = "NAME=VALUE", value_parser = parse_capability)]
        optional: Vec<(String, CapabilityValue)>,

        /// Kinds to try, in order.
        #[arg(long, value_delimiter = ',')]
        prefer: Vec<RuntimeKind>,

        /// Call `Component.method` on the resolved runtime.
        #[arg(long, value_name = "COMPONENT.METHOD")]
        exec: Option<String>,

        /// JSON array of arguments for `--exec`.
        #[arg(long, default_value = "[]")]
        args: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,shim_runtime=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ConfigFile::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => default_config(),
    };
    info!(backends = config.backends.len(), "Configuration loaded");

    let pool = Arc::new(build_pool(&config));

    let result = match cli.command {
        Command::Backends => {
            list_backends(&pool);
            Ok(())
        }
        Command::Resolve {
            require,
            optional,
            prefer,
            exec,
            args,
        } => {
            let mut set = CapabilitySet::new();
            for (name, value) in require {
                set = set.require(name, value);
            }
            for (name, value) in optional {
                set = set.prefer(name, value);
            }
            let request = RuntimeRequest::new(set).prefer(prefer);
            resolve(&pool, request, exec.as_deref(), &args).await
        }
    };

    pool.shutdown();
    result
}

fn build_pool(config: &ConfigFile) -> RuntimePool {
    let mut builder = RuntimePool::builder().config(config.runtime.clone());
    for entry in &config.backends {
        let mut factory = ScriptedFactory::new(entry.clone());
        if entry.capabilities.get(caps::RESIZE_IMAGE) == Some(&CapabilityValue::Bool(true)) {
            factory = factory.with_image(ImageInfo::new(1600, 1200, "image/jpeg"));
        }
        builder = builder.backend(LoggingFactory::new(factory));
    }
    builder.build()
}

fn list_backends(pool: &RuntimePool) {
    let registry = pool.registry();
    for descriptor in registry.descriptors() {
        println!(
            "{:<12} {:>5}  {}",
            descriptor.kind.as_str(),
            descriptor.priority,
            registry.capabilities(&descriptor.kind).join(", ")
        );
    }
}

async fn resolve(
    pool: &Arc<RuntimePool>,
    request: RuntimeRequest,
    exec: Option<&str>,
    args: &str,
) -> anyhow::Result<()> {
    let owner = EventTarget::new();
    owner.bind(events::ERROR, |event| {
        warn!(payload = %event.payload(), "Exec error event");
    });
    let client = RuntimeClient::new(pool.clone(), owner);

    let runtime = client
        .connect_runtime(request)
        .await
        .context("Runtime resolution failed")?;
    println!("{} {}", runtime.kind(), runtime.uid());

    if let Some(target) = exec {
        let Some((component, method)) = target.split_once('.') else {
            bail!("--exec expects COMPONENT.METHOD, got '{target}'");
        };
        let args: Vec<Value> =
            serde_json::from_str(args).context("--args must be a JSON array")?;
        let out = client
            .exec(component, method, &args)
            .with_context(|| format!("{component}.{method} failed"))?;
        println!("{}", serde_json::to_string_pretty(&out)?);
    }

    client.release();
    Ok(())
}

fn parse_capability(s: &str) -> Result<(String, CapabilityValue), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got '{s}'"))?;
    if name.is_empty() {
        return Err(format!("empty capability name in '{s}'"));
    }
    Ok((name.to_string(), CapabilityValue::parse(value)))
}

fn backend_entry(
    kind: RuntimeKind,
    priority: i32,
    capabilities: &[(&str, CapabilityValue)],
    components: &[(&str, &[&str])],
) -> BackendEntry {
    BackendEntry {
        kind,
        priority,
        capabilities: capabilities
            .iter()
            .map(|(name, value)| ((*name).to_string(), value.clone()))
            .collect(),
        init: InitBehavior::Ready,
        init_delay_ms: 0,
        components: components
            .iter()
            .map(|(name, methods)| {
                let methods = methods.iter().map(|m| (*m).to_string()).collect();
                ((*name).to_string(), methods)
            })
            .collect::<BTreeMap<_, _>>(),
    }
}

fn default_config() -> ConfigFile {
    let html5 = backend_entry(
        RuntimeKind::Html5,
        100,
        &[
            (caps::CREATE_CANVAS, true.into()),
            (caps::DISPLAY_MEDIA, false.into()),
            (caps::USE_DATA_URI_OF, 32_768_i64.into()),
            (caps::READ_BINARY, true.into()),
            (caps::SEND_MULTIPART, true.into()),
            (caps::RESIZE_IMAGE, true.into()),
        ],
        &[
            ("FileReader", &["readAsText", "readAsDataURL"]),
            ("XMLHttpRequest", &["send", "abort"]),
        ],
    );
    let flash = BackendEntry {
        init_delay_ms: 50,
        ..backend_entry(
            RuntimeKind::Flash,
            50,
            &[
                (caps::DISPLAY_MEDIA, true.into()),
                (caps::READ_BINARY, true.into()),
                (caps::SEND_MULTIPART, true.into()),
                (caps::RESIZE_IMAGE, true.into()),
            ],
            &[("FileReader", &["readAsBinaryString"])],
        )
    };
    let silverlight = BackendEntry {
        init: InitBehavior::Fail,
        init_delay_ms: 30,
        ..backend_entry(
            RuntimeKind::Silverlight,
            40,
            &[
                (caps::READ_BINARY, true.into()),
                (caps::SEND_MULTIPART, true.into()),
            ],
            &[("FileReader", &["readAsBinaryString"])],
        )
    };
    let html4 = backend_entry(
        RuntimeKind::Html4,
        10,
        &[(caps::SEND_MULTIPART, true.into())],
        &[("Transporter", &["send"])],
    );

    ConfigFile {
        runtime: RuntimeConfig::default(),
        backends: vec![html5, flash, silverlight, html4],
    }
}
