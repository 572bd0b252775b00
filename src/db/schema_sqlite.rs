// SQLite schema definitions
// This file mirrors schema.rs but stores timestamps as RFC3339 text

diesel::table! {
    post_correspondence (local_post_id) {
        local_post_id -> Text,
        remote_message_id -> Text,
        remote_context_id -> Text,
        last_update_at -> BigInt,
    }
}

diesel::table! {
    channel_link (local_channel_id) {
        local_channel_id -> Text,
        local_team_id -> Text,
        remote_team_id -> Text,
        remote_channel_id -> Text,
        creator_user_id -> Text,
    }
}

diesel::table! {
    subscription (subscription_id) {
        subscription_id -> Text,
        kind -> Text,
        remote_team_id -> Nullable<Text>,
        remote_channel_id -> Nullable<Text>,
        secret -> Text,
        expires_on -> Text,
        last_activity_at -> Nullable<Text>,
    }
}

diesel::table! {
    user_linkage (local_user_id) {
        local_user_id -> Text,
        remote_user_id -> Text,
        token -> Nullable<Text>,
        last_chat_received_at -> Nullable<BigInt>,
    }
}

diesel::table! {
    invited_user (local_user_id) {
        local_user_id -> Text,
        invite_pending_since -> Text,
        invite_last_sent_at -> Text,
    }
}

diesel::table! {
    whitelist (local_user_id) {
        local_user_id -> Text,
    }
}

diesel::table! {
    oauth_state (nonce) {
        nonce -> Text,
        created_at -> Text,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    post_correspondence,
    channel_link,
    subscription,
    user_linkage,
    invited_user,
    whitelist,
    oauth_state,
);
