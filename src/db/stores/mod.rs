use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::DatabaseError;
use super::models::{
    ChannelLink, InvitedUser, PostCorrespondence, SubscriptionRecord, UserLinkage,
};

#[async_trait]
pub trait PostStore: Send + Sync {
    /// Upserts by `local_post_id`. Fails with `Conflict` when a different
    /// local post already maps the same remote message.
    async fn link_posts(&self, correspondence: &PostCorrespondence) -> Result<(), DatabaseError>;
    async fn get_by_local(
        &self,
        local_post_id: &str,
    ) -> Result<Option<PostCorrespondence>, DatabaseError>;
    async fn get_by_remote(
        &self,
        context_id: &str,
        remote_message_id: &str,
    ) -> Result<Option<PostCorrespondence>, DatabaseError>;
    /// Never moves the stored timestamp backward.
    async fn set_last_update_at_by_local(
        &self,
        local_post_id: &str,
        last_update_at: i64,
    ) -> Result<(), DatabaseError>;
    async fn set_last_update_at_by_remote(
        &self,
        remote_message_id: &str,
        last_update_at: i64,
    ) -> Result<(), DatabaseError>;
    async fn delete_by_local(&self, local_post_id: &str) -> Result<(), DatabaseError>;
}

#[async_trait]
pub trait ChannelLinkStore: Send + Sync {
    async fn store_channel_link(&self, link: &ChannelLink) -> Result<(), DatabaseError>;
    /// Removes the link and its channel subscription in one transaction.
    async fn delete_link_by_channel_id(&self, local_channel_id: &str) -> Result<(), DatabaseError>;
    async fn get_link_by_channel_id(
        &self,
        local_channel_id: &str,
    ) -> Result<Option<ChannelLink>, DatabaseError>;
    async fn get_link_by_remote_channel_id(
        &self,
        remote_team_id: &str,
        remote_channel_id: &str,
    ) -> Result<Option<ChannelLink>, DatabaseError>;
    async fn list_channel_links(&self) -> Result<Vec<ChannelLink>, DatabaseError>;
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Replaces any subscription already recorded for the same remote channel.
    async fn save_channel_subscription(
        &self,
        subscription: &SubscriptionRecord,
    ) -> Result<(), DatabaseError>;
    /// Replaces the current chats subscription, keeping at most one.
    async fn save_global_subscription(
        &self,
        subscription: &SubscriptionRecord,
    ) -> Result<(), DatabaseError>;
    async fn update_subscription_expires_on(
        &self,
        subscription_id: &str,
        expires_on: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;
    async fn update_subscription_last_activity_at(
        &self,
        subscription_id: &str,
        last_activity_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;
    async fn delete_subscription(&self, subscription_id: &str) -> Result<(), DatabaseError>;
    async fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<SubscriptionRecord>, DatabaseError>;
    async fn list_global_subscriptions(&self) -> Result<Vec<SubscriptionRecord>, DatabaseError>;
    async fn list_channel_subscriptions(&self) -> Result<Vec<SubscriptionRecord>, DatabaseError>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    /// A `None` token marks the user as disconnected.
    async fn set_user_info(
        &self,
        local_user_id: &str,
        remote_user_id: &str,
        token: Option<&str>,
    ) -> Result<(), DatabaseError>;
    async fn get_user_linkage(
        &self,
        local_user_id: &str,
    ) -> Result<Option<UserLinkage>, DatabaseError>;
    async fn delete_user_info(&self, local_user_id: &str) -> Result<(), DatabaseError>;
    async fn get_token_for_local_user(
        &self,
        local_user_id: &str,
    ) -> Result<Option<String>, DatabaseError>;
    async fn get_token_for_remote_user(
        &self,
        remote_user_id: &str,
    ) -> Result<Option<String>, DatabaseError>;
    async fn teams_to_local(&self, remote_user_id: &str) -> Result<Option<String>, DatabaseError>;
    async fn local_to_teams(&self, local_user_id: &str) -> Result<Option<String>, DatabaseError>;
    async fn set_users_last_chat_received_at(
        &self,
        local_user_ids: &[String],
        last_chat_received_at: i64,
    ) -> Result<(), DatabaseError>;
    async fn list_connected_users(&self) -> Result<Vec<UserLinkage>, DatabaseError>;
    async fn is_user_connected(&self, local_user_id: &str) -> Result<bool, DatabaseError> {
        Ok(self
            .get_user_linkage(local_user_id)
            .await?
            .is_some_and(|linkage| linkage.is_connected()))
    }
}

#[async_trait]
pub trait InviteStore: Send + Sync {
    async fn store_invited_user(&self, invited: &InvitedUser) -> Result<(), DatabaseError>;
    async fn get_invited_user(
        &self,
        local_user_id: &str,
    ) -> Result<Option<InvitedUser>, DatabaseError>;
    async fn delete_invited_user(&self, local_user_id: &str) -> Result<(), DatabaseError>;
    async fn count_invited_users(&self) -> Result<i64, DatabaseError>;
    async fn store_whitelist(&self, local_user_id: &str) -> Result<(), DatabaseError>;
    async fn is_user_whitelisted(&self, local_user_id: &str) -> Result<bool, DatabaseError>;
    async fn count_whitelisted(&self) -> Result<i64, DatabaseError>;
    async fn store_oauth_state(&self, nonce: &str) -> Result<(), DatabaseError>;
    /// Consumes the nonce. Returns false when it is unknown or older than `max_age`.
    async fn verify_and_delete_oauth_state(
        &self,
        nonce: &str,
        max_age: chrono::Duration,
    ) -> Result<bool, DatabaseError>;
    async fn delete_expired_oauth_states(
        &self,
        max_age: chrono::Duration,
    ) -> Result<usize, DatabaseError>;
}
