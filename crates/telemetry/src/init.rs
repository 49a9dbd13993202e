use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

/// Default filter when `RUST_LOG` is absent: the w3f crates at debug so a
/// run's lifecycle (ports, proxies, sandbox, teardown) is visible, the
/// rest of the dependency tree at info.
const DEFAULT_DIRECTIVES: &str =
    "info,w3f_runner=debug,w3f_proxy=debug,w3f_sandbox=debug,w3f_guest=debug";

/// Installs the process-wide subscriber: JSON lines on stderr, one per
/// event, filtered by `RUST_LOG` when set. Also bridges `log`-emitting
/// dependencies into tracing. Errors if a subscriber is already installed.
pub fn init_tracing() -> Result<(), anyhow::Error> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));
    let output = fmt::layer()
        .json()
        .with_target(true)
        .with_writer(std::io::stderr);
    tracing_log::LogTracer::init()?;
    tracing::subscriber::set_global_default(Registry::default().with(filter).with(output))?;
    Ok(())
}
