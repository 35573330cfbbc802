use anyhow::Result;
use serde_json::{Value, json};
use tracing::{info, warn};

use fleet_link::mux::{MuxStatus, Multiplexer};
use fleet_link::{MuxConfig, WsConnector};

/// One output line per event: `{"cluster":..,"user":..,"data":..}`.
pub fn event_line(cluster: &str, user: &str, data: &Value) -> String {
    json!({ "cluster": cluster, "user": user, "data": data }).to_string()
}

/// Print events for every `(cluster, user)` pair until Ctrl-C, or until the
/// socket drops and every reconnect attempt has failed.
pub async fn run(mux_url: &str, cluster: &str, users: &[String], config: MuxConfig) -> Result<()> {
    let mux = Multiplexer::new(WsConnector, mux_url, config);

    let subscriptions: Vec<_> = users
        .iter()
        .map(|user| {
            let (c, u) = (cluster.to_string(), user.clone());
            mux.subscribe(cluster, user.as_str(), move |data| {
                println!("{}", event_line(&c, &u, data));
            })
        })
        .collect();
    info!(url = %mux_url, cluster, subscriptions = subscriptions.len(), "watching events");

    let mut status = mux.status();
    let exhausted = tokio::select! {
        _ = status.wait_for(|s: &MuxStatus| s.retry_exhausted) => true,
        _ = tokio::signal::ctrl_c() => false,
    };

    drop(subscriptions);
    mux.close().await;

    if exhausted {
        warn!("event socket lost and reconnect attempts exhausted");
        anyhow::bail!("lost connection to {mux_url}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_line_wraps_payload() {
        let line = event_line("c1", "42", &json!({"kind": "deploy"}));
        let parsed: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(
            parsed,
            json!({"cluster": "c1", "user": "42", "data": {"kind": "deploy"}})
        );
    }
}
