//! Session watch example.
//!
//! Signs in, subscribes to analysis progress and trading updates, starts one
//! analysis and prints pushes until the analysis completes or the session
//! ends.
//!
//! Before running:
//! - Point `TRADEAGENTS_API_URL` / `TRADEAGENTS_WS_URL` at a backend, or use
//!   the local defaults.
//! - Set `TRADEAGENTS_USERNAME` and `TRADEAGENTS_PASSWORD`.
//! - `RUST_LOG=tradeagents_client=debug` shows pipeline and channel events.
//!
//! Tokens are stored in `./.tradeagents-credentials.json`, so a second run
//! resumes without logging in again.

use std::error::Error;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use tradeagents_client::api::types::{LoginRequest, Market, StartAnalysisRequest};
use tradeagents_client::{
    ClientConfig, FileCredentialStore, MessageKind, PushMessage, SessionController, SessionEvent,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = ClientConfig::from_env();
    let store = Arc::new(FileCredentialStore::open(".tradeagents-credentials.json"));
    let session = SessionController::new(config, store)?;

    let user = match session.resume().await? {
        Some(user) => user,
        None => {
            let request = LoginRequest {
                username: std::env::var("TRADEAGENTS_USERNAME")?,
                password: std::env::var("TRADEAGENTS_PASSWORD")?,
            };
            session.login(&request).await?
        }
    };
    println!("signed in as {} ({})", user.username, user.id);

    let (push_tx, mut push_rx) = mpsc::unbounded_channel();
    let registry = session.channel().registry().clone();
    for kind in [MessageKind::AnalysisProgress, MessageKind::TradingUpdate] {
        let push_tx = push_tx.clone();
        registry.subscribe(kind, move |message| {
            let _ = push_tx.send(message.clone());
        });
    }

    let task = session
        .api()
        .start_analysis(&StartAnalysisRequest {
            symbol: "600519".to_string(),
            market: Market::Cn,
            analysis_date: None,
            depth: Some(3),
        })
        .await?;
    println!("analysis {} started", task.id);

    let mut session_events = session.events();
    loop {
        tokio::select! {
            Some(message) = push_rx.recv() => match message {
                PushMessage::AnalysisProgress(progress) => {
                    println!("[{:>5.1}%] {} {}", progress.progress, progress.stage, progress.message);
                    if progress.task_id == task.id && progress.is_complete() {
                        break;
                    }
                }
                PushMessage::TradingUpdate(update) => {
                    println!("order {} {} {}", update.order_id, update.event, update.symbol);
                }
                other => println!("push {}", other.type_tag()),
            },
            event = session_events.recv() => {
                if let Ok(SessionEvent::LoggedOut { reason }) = event {
                    eprintln!("session ended: {reason:?}");
                    return Ok(());
                }
            }
        }
    }

    let result = session.api().analysis_result(&task.id).await?;
    if let Some(recommendation) = result.result.and_then(|result| result.recommendation) {
        println!(
            "recommendation: {} (confidence {:.2})",
            recommendation.action, recommendation.confidence
        );
    }
    Ok(())
}
