use salvo::http::header::CONTENT_TYPE;
use salvo::prelude::*;
use tracing::warn;

use crate::bridge::BridgeCore;
use crate::cache::AsyncTimedCache;
use crate::msteams::ClientError;
use crate::web::web_state;

/// Returns the remote user's avatar, served from the cache while fresh.
pub(crate) async fn load_avatar(
    core: &BridgeCore,
    cache: &AsyncTimedCache<String, Vec<u8>>,
    user_id: &str,
) -> Result<Vec<u8>, ClientError> {
    let key = user_id.to_string();
    if let Some(bytes) = cache.get(&key).await {
        return Ok(bytes);
    }
    let bytes = core.clients().app_client().get_user_avatar(user_id).await?;
    cache.insert(key, bytes.clone()).await;
    Ok(bytes)
}

#[handler]
pub async fn get_avatar(req: &mut Request, res: &mut Response) {
    let Some(user_id) = req.param::<String>("userId") else {
        res.status_code(StatusCode::BAD_REQUEST);
        return;
    };
    let state = web_state();
    match load_avatar(&state.core, &state.avatars, &user_id).await {
        Ok(bytes) => {
            let _ = res.add_header(CONTENT_TYPE, "image/jpeg", true);
            let _ = res.write_body(bytes);
        }
        Err(e) if e.is_not_found() => {
            res.status_code(StatusCode::NOT_FOUND);
        }
        Err(e) => {
            warn!("unable to get the user avatar user_id={} error={}", user_id, e);
            res.status_code(StatusCode::INTERNAL_SERVER_ERROR);
        }
    }
}
