use crate::config::Config;
use crate::model::SystemClock;
use crate::rcon;
use crate::registry::{EndpointRegistry, ServerEndpoint};
use crate::session::{PresenceService, SessionSettings};
use crate::tracker::{LogNotifier, Notifier, WebhookNotifier};
use rand::{distributions::Alphanumeric, Rng};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    if let Some(ref command) = std::env::args().nth(1) {
        match command.as_str() {
            "config-init" => return handle_config_init(),
            "endpoint-add" => return handle_endpoint_add(&config),
            "endpoint-remove" => return handle_endpoint_remove(&config),
            "endpoint-list" => return handle_endpoint_list(&config),
            "query" => return handle_query(&config).await,
            other => return Err(format!("unknown command: {other}").into()),
        }
    }

    let registry = load_registry(&config);
    tracing::info!(
        endpoints = registry.len(),
        path = %registry.path().display(),
        "endpoint registry loaded"
    );

    let notifier: Arc<dyn Notifier> = match config.notifier.webhook_url.as_deref() {
        Some(url) => Arc::new(WebhookNotifier::new(url)?),
        None => Arc::new(LogNotifier),
    };

    let settings = SessionSettings {
        poll: config.poll.settings(),
        tracker_interval: config.tracker_interval(),
        queue_capacity: config.tracker.queue_capacity,
        stop_grace: config.stop_grace(),
    };
    let service = Arc::new(PresenceService::new(
        registry,
        Arc::new(SystemClock),
        notifier,
        settings,
    ));

    let token = match config.server.token.clone() {
        Some(token) => token,
        None => {
            let token = generate_token(32);
            println!("Control API token: {}", token);
            token
        }
    };

    let addr: SocketAddr = format!("127.0.0.1:{}", config.server.port).parse()?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let result = tokio::select! {
        res = crate::server::start(addr, token, service.clone(), shutdown_rx) => res,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown: ctrl-c");
            let _ = shutdown_tx.send(true);
            Ok(())
        }
    };

    if service.is_active().await {
        if let Ok(attendance) = service.stop_session().await {
            for entry in attendance {
                tracing::info!(
                    name = %entry.name,
                    elapsed_secs = entry.elapsed_secs,
                    "attendance at shutdown"
                );
            }
        }
    }

    result
}

/// Loads persisted endpoints; a broken file starts an empty registry.
fn load_registry(config: &Config) -> EndpointRegistry {
    let (registry, err) = EndpointRegistry::load(&config.registry.path);
    if let Some(err) = err {
        tracing::warn!(
            path = %config.registry.path,
            error = %err,
            "failed to load endpoint registry; starting empty"
        );
    }
    registry
}

fn handle_config_init() -> Result<(), Box<dyn std::error::Error>> {
    let path = Config::default_path();
    Config::write_default(&path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}

fn parse_port(value: Option<String>) -> Result<u16, Box<dyn std::error::Error>> {
    let raw = value.ok_or("missing port")?;
    let port: u16 = raw.parse().map_err(|_| format!("invalid port: {raw}"))?;
    if port == 0 {
        return Err("port must be non-zero".into());
    }
    Ok(port)
}

fn handle_endpoint_add(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(2);
    let address = args.next().ok_or("missing address")?;
    let port = parse_port(args.next())?;
    let password = args.next().ok_or("missing password")?;
    let comment = args.collect::<Vec<_>>().join(" ");

    let mut registry = load_registry(config);
    let endpoint = ServerEndpoint {
        address,
        port,
        password,
        comment,
    };
    let key = endpoint.key();
    let replaced = registry.register(endpoint).is_some();
    registry.save()?;

    println!(
        "{} endpoint {}",
        if replaced { "Updated" } else { "Added" },
        key
    );
    Ok(())
}

fn handle_endpoint_remove(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(2);
    let address = args.next().ok_or("missing address")?;
    let port = parse_port(args.next())?;

    let mut registry = load_registry(config);
    if registry.unregister(&address, port).is_none() {
        return Err(format!("no endpoint registered at {address}:{port}").into());
    }
    registry.save()?;
    println!("Removed endpoint {}:{}", address, port);
    Ok(())
}

fn handle_endpoint_list(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let registry = load_registry(config);
    for endpoint in registry.list() {
        if endpoint.comment.is_empty() {
            println!("{}:{}", endpoint.address, endpoint.port);
        } else {
            println!("{}:{} ({})", endpoint.address, endpoint.port, endpoint.comment);
        }
    }
    Ok(())
}

async fn handle_query(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(2);
    let address = args.next().ok_or("missing address")?;
    let port = parse_port(args.next())?;
    let password = args.next().ok_or("missing password")?;
    let command = args.next().unwrap_or_else(|| config.poll.command.clone());

    let endpoint = ServerEndpoint {
        address,
        port,
        password,
        comment: String::new(),
    };
    let timeout = Duration::from_millis(config.poll.timeout_ms);
    let body = rcon::try_query(&endpoint, &command, timeout).await?;
    println!("{}", body);
    Ok(())
}

fn generate_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_are_alphanumeric() {
        let token = generate_token(32);
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn port_parsing_rejects_garbage() {
        assert_eq!(parse_port(Some("27015".to_string())).unwrap(), 27015);
        assert!(parse_port(Some("0".to_string())).is_err());
        assert!(parse_port(Some("abc".to_string())).is_err());
        assert!(parse_port(None).is_err());
    }
}
