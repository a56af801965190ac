use serde_json::json;
use tether_state::{EventKind, StateEvent};
use tokio::sync::mpsc;
use tracing::warn;

use super::Live;

pub async fn run() -> anyhow::Result<()> {
    let live = Live::open().await?;
    if let Err(e) = live.ensure_logged_in().await {
        live.shutdown().await;
        return Err(e);
    }

    let store = live.session.store();
    let (tx, mut events) = mpsc::unbounded_channel::<StateEvent>();
    for kind in EventKind::ALL {
        let tx = tx.clone();
        store.subscribe(kind, move |event| {
            let _ = tx.send(event.clone());
        });
    }
    drop(tx);
    let mut errors = live.session.take_errors();

    println!("Watching {} (Ctrl-C to stop)", live.session.lifecycle());
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Some(event) = events.recv() => println!("{}", describe(&event)),
            Some(err) = recv_error(&mut errors) => warn!(error = %err, "Observed response rejected"),
        }
    }

    live.shutdown().await;
    Ok(())
}

async fn recv_error(
    errors: &mut Option<mpsc::UnboundedReceiver<tether_core::Error>>,
) -> Option<tether_core::Error> {
    match errors {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn describe(event: &StateEvent) -> String {
    let detail = match event {
        StateEvent::Session(session) => json!({
            "user": session.user.as_ref().map(|u| u.email.clone()),
            "expires": session.expires,
        }),
        StateEvent::Catalog(catalog) => json!({
            "models": catalog.models.iter().map(|m| m.slug.clone()).collect::<Vec<_>>(),
        }),
        StateEvent::Account(account) => json!({ "keys": account.0.keys().collect::<Vec<_>>() }),
        StateEvent::History { inserted, total } => json!({ "inserted": inserted, "total": total }),
    };
    format!("{} {}", event.kind(), detail)
}
