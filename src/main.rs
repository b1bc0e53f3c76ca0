use std::sync::Arc;

use deskrelay::automation::{Engine, MemoryRuleStore};
use deskrelay::config::{AutomationConfig, PipelineConfig};
use deskrelay::hub::ws::hub_routes;
use deskrelay::hub::{Broadcaster, SessionHub};
use deskrelay::inbox::{EmailInbox, EmailInboxConfig, InboxRegistry};
use deskrelay::models::Actor;
use deskrelay::pipeline::Pipeline;
use deskrelay::store::MemoryStore;
use deskrelay::template::DefaultTemplates;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let pipeline_cfg = PipelineConfig::from_env();
    let automation_cfg = AutomationConfig::from_env();

    let ws_port: u16 = std::env::var("DESKRELAY_WS_PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse()
        .unwrap_or(8080);

    eprintln!("deskrelay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Hub WS: ws://0.0.0.0:{}/ws", ws_port);
    eprintln!(
        "   Pipeline: {} ingress / {} dispatch workers, scan every {:?}",
        pipeline_cfg.incoming_workers, pipeline_cfg.dispatch_workers, pipeline_cfg.scan_interval
    );

    // ── Storage ─────────────────────────────────────────────────────
    let store = Arc::new(MemoryStore::new());
    let rule_store = Arc::new(MemoryRuleStore::new());

    // ── Inboxes ─────────────────────────────────────────────────────
    let inboxes = Arc::new(InboxRegistry::new());
    if let Some(email_config) = EmailInboxConfig::from_env() {
        eprintln!(
            "   Email: enabled (SMTP: {}:{}, from: {})",
            email_config.smtp_host, email_config.smtp_port, email_config.from_address
        );
        let inbox_id: i64 = std::env::var("DESKRELAY_INBOX_ID")
            .unwrap_or_else(|_| "1".to_string())
            .parse()
            .unwrap_or(1);
        inboxes.register(Arc::new(EmailInbox::new(inbox_id, email_config)?));
    } else {
        eprintln!("   Email: disabled (DESKRELAY_SMTP_HOST not set)");
    }

    // ── Hub ─────────────────────────────────────────────────────────
    let hub = Arc::new(SessionHub::new());
    let broadcaster = Broadcaster::new(hub.clone());

    // ── Automation + pipeline ───────────────────────────────────────
    let system_actor = Actor {
        id: 0,
        name: "System".to_string(),
    };
    let engine = Engine::new(automation_cfg, rule_store, system_actor);

    let pipeline = Pipeline::new(
        pipeline_cfg,
        store,
        inboxes,
        Arc::new(DefaultTemplates::new()),
        broadcaster,
        engine.handle(),
    );
    engine.set_conversation_store(pipeline.clone()).await;

    engine.start().await?;
    pipeline.start().await?;

    // ── Hub WebSocket server ────────────────────────────────────────
    let app = hub_routes(hub);
    tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", ws_port))
            .await
            .expect("Failed to bind hub server port");
        tracing::info!(port = ws_port, "Hub WebSocket server started");
        axum::serve(listener, app).await.ok();
    });

    tokio::signal::ctrl_c().await?;
    eprintln!("\nShutting down...");
    pipeline.shutdown().await;
    engine.shutdown().await;

    Ok(())
}
