use salvo::prelude::*;
use serde_json::{Value, json};

use crate::web::{WebState, web_state};

#[handler]
pub async fn health_check(res: &mut Response) {
    res.render("OK");
}

pub(crate) fn status_body(state: &WebState) -> Value {
    let metrics = state.core.metrics();
    json!({
        "status": if state.activities.is_quitting() { "stopping" } else { "running" },
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "activity": {
            "queue_length": metrics.change_event_queue_length(),
        },
        "sync": {
            "linked_channels": state.core.config().sync.sync_linked_channels,
            "direct_messages": state.core.config().sync.sync_direct_messages,
            "chats": state.core.config().sync.sync_chats,
        }
    })
}

#[handler]
pub async fn get_status(res: &mut Response) {
    res.render(Json(status_body(web_state())));
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::bridge::activity::ActivityHandler;
    use crate::bridge::hooks::{HostPromoter, LocalHooks};
    use crate::testing::TestBridge;

    #[tokio::test]
    async fn status_reports_queue_and_gates() {
        let env = TestBridge::new().await;
        let activities = ActivityHandler::new(env.bridge.clone());
        let hooks = Arc::new(LocalHooks::new(
            env.bridge.clone(),
            Arc::new(HostPromoter::new(env.bridge.host().clone())),
        ));
        let state = WebState::new(env.bridge.clone(), activities, hooks);

        let body = status_body(&state);
        assert_eq!(body["status"], "running");
        assert_eq!(body["activity"]["queue_length"], 0);
        assert_eq!(body["sync"]["chats"], true);
        assert_eq!(body["sync"]["linked_channels"], false);
    }
}
