use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::upsert::excluded;

use super::DatabaseError;
use super::models::{
    ChannelLink, InvitedUser, PostCorrespondence, SubscriptionKind, SubscriptionRecord,
    UserLinkage,
};
use crate::db::manager::Pool;
use crate::db::schema::{
    channel_link, invited_user, oauth_state, post_correspondence, subscription, user_linkage,
    whitelist,
};
use crate::utils::TokenCipher;

async fn run_blocking<T, F>(pool: &Pool, f: F) -> Result<T, DatabaseError>
where
    T: Send + 'static,
    F: FnOnce(&mut PgConnection) -> Result<T, DatabaseError> + Send + 'static,
{
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || {
        let mut conn = pool
            .get()
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;
        f(&mut conn)
    })
    .await
    .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = post_correspondence)]
struct DbPostCorrespondence {
    local_post_id: String,
    remote_message_id: String,
    remote_context_id: String,
    last_update_at: i64,
}

impl From<DbPostCorrespondence> for PostCorrespondence {
    fn from(value: DbPostCorrespondence) -> Self {
        Self {
            local_post_id: value.local_post_id,
            remote_message_id: value.remote_message_id,
            remote_context_id: value.remote_context_id,
            last_update_at: value.last_update_at,
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = channel_link)]
struct DbChannelLink {
    local_channel_id: String,
    local_team_id: String,
    remote_team_id: String,
    remote_channel_id: String,
    creator_user_id: String,
}

impl From<DbChannelLink> for ChannelLink {
    fn from(value: DbChannelLink) -> Self {
        Self {
            local_team_id: value.local_team_id,
            local_channel_id: value.local_channel_id,
            remote_team_id: value.remote_team_id,
            remote_channel_id: value.remote_channel_id,
            creator_user_id: value.creator_user_id,
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = subscription)]
struct DbSubscription {
    subscription_id: String,
    kind: String,
    remote_team_id: Option<String>,
    remote_channel_id: Option<String>,
    secret: String,
    expires_on: DateTime<Utc>,
    last_activity_at: Option<DateTime<Utc>>,
}

impl DbSubscription {
    fn from_record(record: &SubscriptionRecord) -> Self {
        Self {
            subscription_id: record.subscription_id.clone(),
            kind: record.kind.as_str().to_string(),
            remote_team_id: record.remote_team_id.clone(),
            remote_channel_id: record.remote_channel_id.clone(),
            secret: record.secret.clone(),
            expires_on: record.expires_on,
            last_activity_at: record.last_activity_at,
        }
    }

    fn into_record(self) -> Result<SubscriptionRecord, DatabaseError> {
        let kind = SubscriptionKind::parse(&self.kind)
            .ok_or_else(|| DatabaseError::Query(format!("unknown subscription kind {}", self.kind)))?;
        Ok(SubscriptionRecord {
            subscription_id: self.subscription_id,
            kind,
            remote_team_id: self.remote_team_id,
            remote_channel_id: self.remote_channel_id,
            secret: self.secret,
            expires_on: self.expires_on,
            last_activity_at: self.last_activity_at,
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = user_linkage)]
struct DbUserLinkage {
    local_user_id: String,
    remote_user_id: String,
    token: Option<String>,
    last_chat_received_at: Option<i64>,
}

impl DbUserLinkage {
    fn into_linkage(self, cipher: &TokenCipher) -> Result<UserLinkage, DatabaseError> {
        let token = self
            .token
            .as_deref()
            .map(|sealed| {
                cipher
                    .decrypt(sealed)
                    .map_err(|e| DatabaseError::Query(format!("unable to decrypt token: {e}")))
            })
            .transpose()?;
        Ok(UserLinkage {
            local_user_id: self.local_user_id,
            remote_user_id: self.remote_user_id,
            token,
            last_chat_received_at: self.last_chat_received_at,
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = invited_user)]
struct DbInvitedUser {
    local_user_id: String,
    invite_pending_since: DateTime<Utc>,
    invite_last_sent_at: DateTime<Utc>,
}

impl From<DbInvitedUser> for InvitedUser {
    fn from(value: DbInvitedUser) -> Self {
        Self {
            local_user_id: value.local_user_id,
            invite_pending_since: value.invite_pending_since,
            invite_last_sent_at: value.invite_last_sent_at,
        }
    }
}

pub struct PostgresPostStore {
    pool: Pool,
}

impl PostgresPostStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl super::PostStore for PostgresPostStore {
    async fn link_posts(&self, correspondence: &PostCorrespondence) -> Result<(), DatabaseError> {
        let corr = correspondence.clone();
        run_blocking(&self.pool, move |conn| {
            conn.transaction::<_, DatabaseError, _>(|conn| {
                use crate::db::schema::post_correspondence::dsl::*;
                let by_remote = post_correspondence
                    .filter(remote_context_id.eq(&corr.remote_context_id))
                    .filter(remote_message_id.eq(&corr.remote_message_id))
                    .select(DbPostCorrespondence::as_select())
                    .for_update()
                    .first::<DbPostCorrespondence>(conn)
                    .optional()?;
                if let Some(existing) = by_remote.as_ref()
                    && existing.local_post_id != corr.local_post_id
                {
                    return Err(DatabaseError::Conflict(format!(
                        "remote message {} is already linked to post {}",
                        corr.remote_message_id, existing.local_post_id
                    )));
                }

                let same_remote = by_remote.is_some();
                let row = DbPostCorrespondence {
                    local_post_id: corr.local_post_id.clone(),
                    remote_message_id: corr.remote_message_id.clone(),
                    remote_context_id: corr.remote_context_id.clone(),
                    last_update_at: corr.last_update_at,
                };
                if same_remote {
                    diesel::update(post_correspondence.filter(local_post_id.eq(&corr.local_post_id)))
                        .filter(last_update_at.lt(corr.last_update_at))
                        .set(last_update_at.eq(corr.last_update_at))
                        .execute(conn)?;
                } else {
                    diesel::insert_into(post_correspondence)
                        .values(&row)
                        .on_conflict(local_post_id)
                        .do_update()
                        .set((
                            remote_message_id.eq(excluded(remote_message_id)),
                            remote_context_id.eq(excluded(remote_context_id)),
                            last_update_at.eq(excluded(last_update_at)),
                        ))
                        .execute(conn)?;
                }
                Ok(())
            })
        })
        .await
    }

    async fn get_by_local(
        &self,
        post_id: &str,
    ) -> Result<Option<PostCorrespondence>, DatabaseError> {
        let post_id = post_id.to_string();
        run_blocking(&self.pool, move |conn| {
            Ok(post_correspondence::table
                .filter(post_correspondence::local_post_id.eq(post_id))
                .select(DbPostCorrespondence::as_select())
                .first::<DbPostCorrespondence>(conn)
                .optional()?
                .map(PostCorrespondence::from))
        })
        .await
    }

    async fn get_by_remote(
        &self,
        context_id: &str,
        message_id: &str,
    ) -> Result<Option<PostCorrespondence>, DatabaseError> {
        let context_id = context_id.to_string();
        let message_id = message_id.to_string();
        run_blocking(&self.pool, move |conn| {
            Ok(post_correspondence::table
                .filter(post_correspondence::remote_context_id.eq(context_id))
                .filter(post_correspondence::remote_message_id.eq(message_id))
                .select(DbPostCorrespondence::as_select())
                .first::<DbPostCorrespondence>(conn)
                .optional()?
                .map(PostCorrespondence::from))
        })
        .await
    }

    async fn set_last_update_at_by_local(
        &self,
        post_id: &str,
        timestamp: i64,
    ) -> Result<(), DatabaseError> {
        let post_id = post_id.to_string();
        run_blocking(&self.pool, move |conn| {
            use crate::db::schema::post_correspondence::dsl::*;
            diesel::update(
                post_correspondence
                    .filter(local_post_id.eq(post_id))
                    .filter(last_update_at.lt(timestamp)),
            )
            .set(last_update_at.eq(timestamp))
            .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn set_last_update_at_by_remote(
        &self,
        message_id: &str,
        timestamp: i64,
    ) -> Result<(), DatabaseError> {
        let message_id = message_id.to_string();
        run_blocking(&self.pool, move |conn| {
            use crate::db::schema::post_correspondence::dsl::*;
            diesel::update(
                post_correspondence
                    .filter(remote_message_id.eq(message_id))
                    .filter(last_update_at.lt(timestamp)),
            )
            .set(last_update_at.eq(timestamp))
            .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn delete_by_local(&self, post_id: &str) -> Result<(), DatabaseError> {
        let post_id = post_id.to_string();
        run_blocking(&self.pool, move |conn| {
            diesel::delete(
                post_correspondence::table.filter(post_correspondence::local_post_id.eq(post_id)),
            )
            .execute(conn)?;
            Ok(())
        })
        .await
    }
}

pub struct PostgresChannelLinkStore {
    pool: Pool,
}

impl PostgresChannelLinkStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl super::ChannelLinkStore for PostgresChannelLinkStore {
    async fn store_channel_link(&self, link: &ChannelLink) -> Result<(), DatabaseError> {
        let row = DbChannelLink {
            local_channel_id: link.local_channel_id.clone(),
            local_team_id: link.local_team_id.clone(),
            remote_team_id: link.remote_team_id.clone(),
            remote_channel_id: link.remote_channel_id.clone(),
            creator_user_id: link.creator_user_id.clone(),
        };
        run_blocking(&self.pool, move |conn| {
            diesel::insert_into(channel_link::table)
                .values(&row)
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn delete_link_by_channel_id(&self, channel_id: &str) -> Result<(), DatabaseError> {
        let channel_id = channel_id.to_string();
        run_blocking(&self.pool, move |conn| {
            conn.transaction::<_, DatabaseError, _>(|conn| {
                let Some(link) = channel_link::table
                    .filter(channel_link::local_channel_id.eq(&channel_id))
                    .select(DbChannelLink::as_select())
                    .for_update()
                    .first::<DbChannelLink>(conn)
                    .optional()?
                else {
                    return Ok(());
                };

                diesel::delete(
                    subscription::table
                        .filter(subscription::kind.eq(SubscriptionKind::Channel.as_str()))
                        .filter(subscription::remote_team_id.eq(&link.remote_team_id))
                        .filter(subscription::remote_channel_id.eq(&link.remote_channel_id)),
                )
                .execute(conn)?;
                diesel::delete(
                    channel_link::table.filter(channel_link::local_channel_id.eq(&channel_id)),
                )
                .execute(conn)?;
                Ok(())
            })
        })
        .await
    }

    async fn get_link_by_channel_id(
        &self,
        channel_id: &str,
    ) -> Result<Option<ChannelLink>, DatabaseError> {
        let channel_id = channel_id.to_string();
        run_blocking(&self.pool, move |conn| {
            Ok(channel_link::table
                .filter(channel_link::local_channel_id.eq(channel_id))
                .select(DbChannelLink::as_select())
                .first::<DbChannelLink>(conn)
                .optional()?
                .map(ChannelLink::from))
        })
        .await
    }

    async fn get_link_by_remote_channel_id(
        &self,
        team_id: &str,
        channel_id: &str,
    ) -> Result<Option<ChannelLink>, DatabaseError> {
        let team_id = team_id.to_string();
        let channel_id = channel_id.to_string();
        run_blocking(&self.pool, move |conn| {
            Ok(channel_link::table
                .filter(channel_link::remote_team_id.eq(team_id))
                .filter(channel_link::remote_channel_id.eq(channel_id))
                .select(DbChannelLink::as_select())
                .first::<DbChannelLink>(conn)
                .optional()?
                .map(ChannelLink::from))
        })
        .await
    }

    async fn list_channel_links(&self) -> Result<Vec<ChannelLink>, DatabaseError> {
        run_blocking(&self.pool, move |conn| {
            let rows = channel_link::table
                .order(channel_link::local_channel_id.asc())
                .select(DbChannelLink::as_select())
                .load::<DbChannelLink>(conn)?;
            Ok(rows.into_iter().map(ChannelLink::from).collect())
        })
        .await
    }
}

pub struct PostgresSubscriptionStore {
    pool: Pool,
}

impl PostgresSubscriptionStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn list_by_kind(
        &self,
        kind: SubscriptionKind,
    ) -> Result<Vec<SubscriptionRecord>, DatabaseError> {
        run_blocking(&self.pool, move |conn| {
            let rows = subscription::table
                .filter(subscription::kind.eq(kind.as_str()))
                .order(subscription::subscription_id.asc())
                .select(DbSubscription::as_select())
                .load::<DbSubscription>(conn)?;
            rows.into_iter().map(DbSubscription::into_record).collect()
        })
        .await
    }
}

#[async_trait]
impl super::SubscriptionStore for PostgresSubscriptionStore {
    async fn save_channel_subscription(
        &self,
        record: &SubscriptionRecord,
    ) -> Result<(), DatabaseError> {
        let row = DbSubscription::from_record(record);
        run_blocking(&self.pool, move |conn| {
            conn.transaction::<_, DatabaseError, _>(|conn| {
                diesel::delete(
                    subscription::table
                        .filter(subscription::kind.eq(SubscriptionKind::Channel.as_str()))
                        .filter(subscription::remote_team_id.eq(&row.remote_team_id))
                        .filter(subscription::remote_channel_id.eq(&row.remote_channel_id)),
                )
                .execute(conn)?;
                diesel::delete(
                    subscription::table
                        .filter(subscription::subscription_id.eq(&row.subscription_id)),
                )
                .execute(conn)?;
                diesel::insert_into(subscription::table)
                    .values(&row)
                    .execute(conn)?;
                Ok(())
            })
        })
        .await
    }

    async fn save_global_subscription(
        &self,
        record: &SubscriptionRecord,
    ) -> Result<(), DatabaseError> {
        let row = DbSubscription::from_record(record);
        run_blocking(&self.pool, move |conn| {
            conn.transaction::<_, DatabaseError, _>(|conn| {
                diesel::delete(
                    subscription::table
                        .filter(subscription::kind.eq(SubscriptionKind::AllChats.as_str())),
                )
                .execute(conn)?;
                diesel::delete(
                    subscription::table
                        .filter(subscription::subscription_id.eq(&row.subscription_id)),
                )
                .execute(conn)?;
                diesel::insert_into(subscription::table)
                    .values(&row)
                    .execute(conn)?;
                Ok(())
            })
        })
        .await
    }

    async fn update_subscription_expires_on(
        &self,
        subscription_id: &str,
        expires_on: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let subscription_id = subscription_id.to_string();
        run_blocking(&self.pool, move |conn| {
            diesel::update(
                subscription::table.filter(subscription::subscription_id.eq(subscription_id)),
            )
            .set(subscription::expires_on.eq(expires_on))
            .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn update_subscription_last_activity_at(
        &self,
        subscription_id: &str,
        last_activity_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let subscription_id = subscription_id.to_string();
        run_blocking(&self.pool, move |conn| {
            diesel::update(
                subscription::table.filter(subscription::subscription_id.eq(subscription_id)),
            )
            .set(subscription::last_activity_at.eq(Some(last_activity_at)))
            .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn delete_subscription(&self, subscription_id: &str) -> Result<(), DatabaseError> {
        let subscription_id = subscription_id.to_string();
        run_blocking(&self.pool, move |conn| {
            diesel::delete(
                subscription::table.filter(subscription::subscription_id.eq(subscription_id)),
            )
            .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<SubscriptionRecord>, DatabaseError> {
        let subscription_id = subscription_id.to_string();
        run_blocking(&self.pool, move |conn| {
            subscription::table
                .filter(subscription::subscription_id.eq(subscription_id))
                .select(DbSubscription::as_select())
                .first::<DbSubscription>(conn)
                .optional()?
                .map(DbSubscription::into_record)
                .transpose()
        })
        .await
    }

    async fn list_global_subscriptions(&self) -> Result<Vec<SubscriptionRecord>, DatabaseError> {
        self.list_by_kind(SubscriptionKind::AllChats).await
    }

    async fn list_channel_subscriptions(&self) -> Result<Vec<SubscriptionRecord>, DatabaseError> {
        self.list_by_kind(SubscriptionKind::Channel).await
    }
}

pub struct PostgresUserStore {
    pool: Pool,
    cipher: Arc<TokenCipher>,
}

impl PostgresUserStore {
    pub fn new(pool: Pool, cipher: Arc<TokenCipher>) -> Self {
        Self { pool, cipher }
    }
}

#[async_trait]
impl super::UserStore for PostgresUserStore {
    async fn set_user_info(
        &self,
        local_id: &str,
        remote_id: &str,
        plain_token: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let local_id = local_id.to_string();
        let remote_id = remote_id.to_string();
        let sealed = plain_token
            .map(|plain| {
                self.cipher
                    .encrypt(plain)
                    .map_err(|e| DatabaseError::Query(format!("unable to encrypt token: {e}")))
            })
            .transpose()?;
        run_blocking(&self.pool, move |conn| {
            use crate::db::schema::user_linkage::dsl::*;
            diesel::insert_into(user_linkage)
                .values((
                    local_user_id.eq(&local_id),
                    remote_user_id.eq(&remote_id),
                    token.eq(&sealed),
                ))
                .on_conflict(local_user_id)
                .do_update()
                .set((remote_user_id.eq(&remote_id), token.eq(&sealed)))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn get_user_linkage(
        &self,
        local_id: &str,
    ) -> Result<Option<UserLinkage>, DatabaseError> {
        let local_id = local_id.to_string();
        let cipher = self.cipher.clone();
        run_blocking(&self.pool, move |conn| {
            user_linkage::table
                .filter(user_linkage::local_user_id.eq(local_id))
                .select(DbUserLinkage::as_select())
                .first::<DbUserLinkage>(conn)
                .optional()?
                .map(|row| row.into_linkage(&cipher))
                .transpose()
        })
        .await
    }

    async fn delete_user_info(&self, local_id: &str) -> Result<(), DatabaseError> {
        let local_id = local_id.to_string();
        run_blocking(&self.pool, move |conn| {
            diesel::delete(user_linkage::table.filter(user_linkage::local_user_id.eq(local_id)))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn get_token_for_local_user(
        &self,
        local_id: &str,
    ) -> Result<Option<String>, DatabaseError> {
        Ok(self
            .get_user_linkage(local_id)
            .await?
            .and_then(|linkage| linkage.token))
    }

    async fn get_token_for_remote_user(
        &self,
        remote_id: &str,
    ) -> Result<Option<String>, DatabaseError> {
        let remote_id = remote_id.to_string();
        let cipher = self.cipher.clone();
        run_blocking(&self.pool, move |conn| {
            let row = user_linkage::table
                .filter(user_linkage::remote_user_id.eq(remote_id))
                .select(DbUserLinkage::as_select())
                .first::<DbUserLinkage>(conn)
                .optional()?;
            Ok(row
                .map(|row| row.into_linkage(&cipher))
                .transpose()?
                .and_then(|linkage| linkage.token))
        })
        .await
    }

    async fn teams_to_local(&self, remote_id: &str) -> Result<Option<String>, DatabaseError> {
        let remote_id = remote_id.to_string();
        run_blocking(&self.pool, move |conn| {
            Ok(user_linkage::table
                .filter(user_linkage::remote_user_id.eq(remote_id))
                .select(user_linkage::local_user_id)
                .first::<String>(conn)
                .optional()?)
        })
        .await
    }

    async fn local_to_teams(&self, local_id: &str) -> Result<Option<String>, DatabaseError> {
        let local_id = local_id.to_string();
        run_blocking(&self.pool, move |conn| {
            Ok(user_linkage::table
                .filter(user_linkage::local_user_id.eq(local_id))
                .select(user_linkage::remote_user_id)
                .first::<String>(conn)
                .optional()?)
        })
        .await
    }

    async fn set_users_last_chat_received_at(
        &self,
        local_ids: &[String],
        timestamp: i64,
    ) -> Result<(), DatabaseError> {
        if local_ids.is_empty() {
            return Ok(());
        }
        let local_ids = local_ids.to_vec();
        run_blocking(&self.pool, move |conn| {
            diesel::update(user_linkage::table.filter(user_linkage::local_user_id.eq_any(local_ids)))
                .set(user_linkage::last_chat_received_at.eq(Some(timestamp)))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn list_connected_users(&self) -> Result<Vec<UserLinkage>, DatabaseError> {
        let cipher = self.cipher.clone();
        run_blocking(&self.pool, move |conn| {
            let rows = user_linkage::table
                .filter(user_linkage::token.is_not_null())
                .order(user_linkage::local_user_id.asc())
                .select(DbUserLinkage::as_select())
                .load::<DbUserLinkage>(conn)?;
            rows.into_iter().map(|row| row.into_linkage(&cipher)).collect()
        })
        .await
    }
}

pub struct PostgresInviteStore {
    pool: Pool,
}

impl PostgresInviteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl super::InviteStore for PostgresInviteStore {
    async fn store_invited_user(&self, invited: &InvitedUser) -> Result<(), DatabaseError> {
        let invited = invited.clone();
        run_blocking(&self.pool, move |conn| {
            use crate::db::schema::invited_user::dsl::*;
            diesel::insert_into(invited_user)
                .values((
                    local_user_id.eq(&invited.local_user_id),
                    invite_pending_since.eq(invited.invite_pending_since),
                    invite_last_sent_at.eq(invited.invite_last_sent_at),
                ))
                .on_conflict(local_user_id)
                .do_update()
                .set((
                    invite_pending_since.eq(invited.invite_pending_since),
                    invite_last_sent_at.eq(invited.invite_last_sent_at),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn get_invited_user(
        &self,
        user_id: &str,
    ) -> Result<Option<InvitedUser>, DatabaseError> {
        let user_id = user_id.to_string();
        run_blocking(&self.pool, move |conn| {
            Ok(invited_user::table
                .filter(invited_user::local_user_id.eq(user_id))
                .select(DbInvitedUser::as_select())
                .first::<DbInvitedUser>(conn)
                .optional()?
                .map(InvitedUser::from))
        })
        .await
    }

    async fn delete_invited_user(&self, user_id: &str) -> Result<(), DatabaseError> {
        let user_id = user_id.to_string();
        run_blocking(&self.pool, move |conn| {
            diesel::delete(invited_user::table.filter(invited_user::local_user_id.eq(user_id)))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn count_invited_users(&self) -> Result<i64, DatabaseError> {
        run_blocking(&self.pool, move |conn| {
            Ok(invited_user::table.count().get_result(conn)?)
        })
        .await
    }

    async fn store_whitelist(&self, user_id: &str) -> Result<(), DatabaseError> {
        let user_id = user_id.to_string();
        run_blocking(&self.pool, move |conn| {
            diesel::insert_into(whitelist::table)
                .values(whitelist::local_user_id.eq(user_id))
                .on_conflict_do_nothing()
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn is_user_whitelisted(&self, user_id: &str) -> Result<bool, DatabaseError> {
        let user_id = user_id.to_string();
        run_blocking(&self.pool, move |conn| {
            let count: i64 = whitelist::table
                .filter(whitelist::local_user_id.eq(user_id))
                .count()
                .get_result(conn)?;
            Ok(count > 0)
        })
        .await
    }

    async fn count_whitelisted(&self) -> Result<i64, DatabaseError> {
        run_blocking(&self.pool, move |conn| {
            Ok(whitelist::table.count().get_result(conn)?)
        })
        .await
    }

    async fn store_oauth_state(&self, nonce: &str) -> Result<(), DatabaseError> {
        let nonce = nonce.to_string();
        run_blocking(&self.pool, move |conn| {
            diesel::insert_into(oauth_state::table)
                .values((
                    oauth_state::nonce.eq(nonce),
                    oauth_state::created_at.eq(Utc::now()),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn verify_and_delete_oauth_state(
        &self,
        nonce: &str,
        max_age: chrono::Duration,
    ) -> Result<bool, DatabaseError> {
        let nonce = nonce.to_string();
        run_blocking(&self.pool, move |conn| {
            let created: Option<DateTime<Utc>> =
                diesel::delete(oauth_state::table.filter(oauth_state::nonce.eq(&nonce)))
                    .returning(oauth_state::created_at)
                    .get_result(conn)
                    .optional()?;
            Ok(created.is_some_and(|created| Utc::now() - created <= max_age))
        })
        .await
    }

    async fn delete_expired_oauth_states(
        &self,
        max_age: chrono::Duration,
    ) -> Result<usize, DatabaseError> {
        let cutoff = Utc::now() - max_age;
        run_blocking(&self.pool, move |conn| {
            Ok(
                diesel::delete(oauth_state::table.filter(oauth_state::created_at.lt(cutoff)))
                    .execute(conn)?,
            )
        })
        .await
    }
}
