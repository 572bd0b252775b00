use salvo::http::header::CONTENT_TYPE;
use salvo::prelude::*;
use tracing::{debug, warn};

use crate::bridge::activity::ActivityHandler;
use crate::msteams::ActivityBatch;
use crate::web::web_state;

/// Queues every activity of a notification batch. Only a body that does
/// not parse is refused; individual discards still count as accepted.
pub(crate) fn accept_batch(handler: &ActivityHandler, body: &[u8]) -> StatusCode {
    let batch: ActivityBatch = match serde_json::from_slice(body) {
        Ok(batch) => batch,
        Err(e) => {
            debug!("unable to parse the activities error={}", e);
            return StatusCode::BAD_REQUEST;
        }
    };
    for activity in batch.value {
        let subscription_id = activity.subscription_id.clone();
        if let Err(e) = handler.handle(activity) {
            warn!(
                "unable to queue activity subscription_id={} error={}",
                subscription_id, e
            );
        }
    }
    StatusCode::ACCEPTED
}

#[handler]
pub async fn process_activity(req: &mut Request, res: &mut Response) {
    if let Some(token) = req.query::<String>("validationToken") {
        res.status_code(StatusCode::OK);
        let _ = res.add_header(CONTENT_TYPE, "text/plain", true);
        res.render(token);
        return;
    }

    let status = match req.payload().await {
        Ok(body) => accept_batch(&web_state().activities, body),
        Err(e) => {
            debug!("unable to read the webhook body error={}", e);
            StatusCode::BAD_REQUEST
        }
    };
    res.status_code(status);
}
