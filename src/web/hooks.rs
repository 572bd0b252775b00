use salvo::http::header::AUTHORIZATION;
use salvo::prelude::*;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

use crate::bridge::hooks::LocalHooks;
use crate::host::{Channel, ChannelMember, Post, Preference, Reaction, User};
use crate::web::web_state;

#[derive(Error, Debug)]
pub(crate) enum HookError {
    #[error("unknown hook event: {0}")]
    UnknownEvent(String),

    #[error("invalid hook payload: {0}")]
    Payload(#[from] serde_json::Error),
}

#[derive(Deserialize)]
struct UpdatedPost {
    post: Post,
    old_post: Post,
}

/// Accepts `Bearer <secret>` only.
pub(crate) fn is_authorized(header: Option<&str>, secret: &str) -> bool {
    let Some(token) = header.and_then(|h| h.strip_prefix("Bearer ")) else {
        return false;
    };
    !secret.is_empty()
        && token.len() == secret.len()
        && token
            .bytes()
            .zip(secret.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

fn parse<T: DeserializeOwned>(body: &[u8]) -> Result<T, HookError> {
    Ok(serde_json::from_slice(body)?)
}

/// Routes one host callback to the local hooks.
pub(crate) async fn dispatch_hook(
    hooks: &LocalHooks,
    event: &str,
    body: &[u8],
) -> Result<Value, HookError> {
    match event {
        "message_posted" => hooks.message_has_been_posted(&parse::<Post>(body)?).await,
        "message_updated" => {
            let update: UpdatedPost = parse(body)?;
            hooks
                .message_has_been_updated(&update.post, &update.old_post)
                .await;
        }
        "message_deleted" => hooks.message_has_been_deleted(&parse::<Post>(body)?).await,
        "reaction_added" => hooks.reaction_has_been_added(&parse::<Reaction>(body)?).await,
        "reaction_removed" => {
            hooks
                .reaction_has_been_removed(&parse::<Reaction>(body)?)
                .await
        }
        "user_will_log_in" => {
            let rejection = hooks.user_will_log_in(&parse::<User>(body)?).await;
            return Ok(json!({ "rejection": rejection }));
        }
        "user_joined_channel" => {
            hooks
                .user_has_joined_channel(&parse::<ChannelMember>(body)?)
                .await
        }
        "channel_created" => hooks.channel_has_been_created(&parse::<Channel>(body)?).await,
        "preferences_changed" => {
            hooks
                .preferences_have_changed(&parse::<Vec<Preference>>(body)?)
                .await
        }
        other => return Err(HookError::UnknownEvent(other.to_string())),
    }
    Ok(json!({}))
}

#[handler]
pub async fn process_hook(req: &mut Request, res: &mut Response) {
    let state = web_state();
    let authorization = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    if !is_authorized(authorization, state.core.config().webhook_secret()) {
        res.status_code(StatusCode::UNAUTHORIZED);
        return;
    }

    let event = req.param::<String>("event").unwrap_or_default();
    let body = match req.payload().await {
        Ok(body) => body.clone(),
        Err(e) => {
            debug!("unable to read the hook body error={}", e);
            res.status_code(StatusCode::BAD_REQUEST);
            return;
        }
    };
    match dispatch_hook(&state.hooks, &event, &body).await {
        Ok(reply) => res.render(Json(reply)),
        Err(e @ HookError::UnknownEvent(_)) => {
            res.status_code(StatusCode::NOT_FOUND);
            res.render(Json(json!({ "error": e.to_string() })));
        }
        Err(e) => {
            debug!("rejected hook event={} error={}", event, e);
            res.status_code(StatusCode::BAD_REQUEST);
            res.render(Json(json!({ "error": e.to_string() })));
        }
    }
}
