use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;

use super::DatabaseError;
use super::models::{
    ChannelLink, InvitedUser, PostCorrespondence, SubscriptionKind, SubscriptionRecord,
    UserLinkage,
};
use crate::db::schema_sqlite::{
    channel_link, invited_user, oauth_state, post_correspondence, subscription, user_linkage,
    whitelist,
};
use crate::utils::TokenCipher;

// Fixed-width UTC timestamps so that text comparison matches time order
pub(crate) fn datetime_to_string(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn string_to_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Query(format!("invalid datetime format: {}", e)))
}

pub(crate) fn establish_connection(path: &str) -> Result<SqliteConnection, DatabaseError> {
    let mut conn =
        SqliteConnection::establish(path).map_err(|e| DatabaseError::Connection(e.to_string()))?;
    conn.batch_execute("PRAGMA busy_timeout = 5000;")
        .map_err(|e| DatabaseError::Connection(e.to_string()))?;
    Ok(conn)
}

async fn run_blocking<T, F>(db_path: &Arc<String>, f: F) -> Result<T, DatabaseError>
where
    T: Send + 'static,
    F: FnOnce(&mut SqliteConnection) -> Result<T, DatabaseError> + Send + 'static,
{
    let db_path = db_path.clone();
    tokio::task::spawn_blocking(move || {
        let mut conn = establish_connection(&db_path)?;
        f(&mut conn)
    })
    .await
    .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
}

#[derive(Debug, Clone, Queryable, Selectable)]
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

#[derive(Insertable)]
#[diesel(table_name = post_correspondence)]
struct NewPostCorrespondence<'a> {
    local_post_id: &'a str,
    remote_message_id: &'a str,
    remote_context_id: &'a str,
    last_update_at: i64,
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

impl From<&ChannelLink> for DbChannelLink {
    fn from(value: &ChannelLink) -> Self {
        Self {
            local_channel_id: value.local_channel_id.clone(),
            local_team_id: value.local_team_id.clone(),
            remote_team_id: value.remote_team_id.clone(),
            remote_channel_id: value.remote_channel_id.clone(),
            creator_user_id: value.creator_user_id.clone(),
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
    expires_on: String,
    last_activity_at: Option<String>,
}

impl DbSubscription {
    fn from_record(record: &SubscriptionRecord) -> Self {
        Self {
            subscription_id: record.subscription_id.clone(),
            kind: record.kind.as_str().to_string(),
            remote_team_id: record.remote_team_id.clone(),
            remote_channel_id: record.remote_channel_id.clone(),
            secret: record.secret.clone(),
            expires_on: datetime_to_string(&record.expires_on),
            last_activity_at: record.last_activity_at.as_ref().map(datetime_to_string),
        }
    }

    fn to_record(&self) -> Result<SubscriptionRecord, DatabaseError> {
        let kind = SubscriptionKind::parse(&self.kind)
            .ok_or_else(|| DatabaseError::Query(format!("unknown subscription kind {}", self.kind)))?;
        Ok(SubscriptionRecord {
            subscription_id: self.subscription_id.clone(),
            kind,
            remote_team_id: self.remote_team_id.clone(),
            remote_channel_id: self.remote_channel_id.clone(),
            secret: self.secret.clone(),
            expires_on: string_to_datetime(&self.expires_on)?,
            last_activity_at: self
                .last_activity_at
                .as_deref()
                .map(string_to_datetime)
                .transpose()?,
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
    fn to_linkage(&self, cipher: &TokenCipher) -> Result<UserLinkage, DatabaseError> {
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
            local_user_id: self.local_user_id.clone(),
            remote_user_id: self.remote_user_id.clone(),
            token,
            last_chat_received_at: self.last_chat_received_at,
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = invited_user)]
struct DbInvitedUser {
    local_user_id: String,
    invite_pending_since: String,
    invite_last_sent_at: String,
}

impl DbInvitedUser {
    fn to_invited_user(&self) -> Result<InvitedUser, DatabaseError> {
        Ok(InvitedUser {
            local_user_id: self.local_user_id.clone(),
            invite_pending_since: string_to_datetime(&self.invite_pending_since)?,
            invite_last_sent_at: string_to_datetime(&self.invite_last_sent_at)?,
        })
    }
}

pub struct SqlitePostStore {
    db_path: Arc<String>,
}

impl SqlitePostStore {
    pub fn new(db_path: Arc<String>) -> Self {
        Self { db_path }
    }
}

#[async_trait]
impl super::PostStore for SqlitePostStore {
    async fn link_posts(&self, correspondence: &PostCorrespondence) -> Result<(), DatabaseError> {
        let corr = correspondence.clone();
        run_blocking(&self.db_path, move |conn| {
            conn.transaction::<_, DatabaseError, _>(|conn| {
                use crate::db::schema_sqlite::post_correspondence::dsl::*;
                let by_remote = post_correspondence
                    .filter(remote_context_id.eq(&corr.remote_context_id))
                    .filter(remote_message_id.eq(&corr.remote_message_id))
                    .select(DbPostCorrespondence::as_select())
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

                let by_local = post_correspondence
                    .filter(local_post_id.eq(&corr.local_post_id))
                    .select(DbPostCorrespondence::as_select())
                    .first::<DbPostCorrespondence>(conn)
                    .optional()?;
                match by_local {
                    Some(existing) => {
                        let same_remote = existing.remote_message_id == corr.remote_message_id
                            && existing.remote_context_id == corr.remote_context_id;
                        let new_update_at = if same_remote {
                            existing.last_update_at.max(corr.last_update_at)
                        } else {
                            corr.last_update_at
                        };
                        diesel::update(post_correspondence.filter(local_post_id.eq(&corr.local_post_id)))
                            .set((
                                remote_message_id.eq(&corr.remote_message_id),
                                remote_context_id.eq(&corr.remote_context_id),
                                last_update_at.eq(new_update_at),
                            ))
                            .execute(conn)?;
                    }
                    None => {
                        diesel::insert_into(post_correspondence)
                            .values(NewPostCorrespondence {
                                local_post_id: &corr.local_post_id,
                                remote_message_id: &corr.remote_message_id,
                                remote_context_id: &corr.remote_context_id,
                                last_update_at: corr.last_update_at,
                            })
                            .execute(conn)?;
                    }
                }
                Ok(())
            })
        })
        .await
    }

    async fn get_by_local(
        &self,
        local_post_id: &str,
    ) -> Result<Option<PostCorrespondence>, DatabaseError> {
        let post_id = local_post_id.to_string();
        run_blocking(&self.db_path, move |conn| {
            use crate::db::schema_sqlite::post_correspondence::dsl::*;
            Ok(post_correspondence
                .filter(local_post_id.eq(post_id))
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
        run_blocking(&self.db_path, move |conn| {
            use crate::db::schema_sqlite::post_correspondence::dsl::*;
            Ok(post_correspondence
                .filter(remote_context_id.eq(context_id))
                .filter(remote_message_id.eq(message_id))
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
        run_blocking(&self.db_path, move |conn| {
            use crate::db::schema_sqlite::post_correspondence::dsl::*;
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
        run_blocking(&self.db_path, move |conn| {
            use crate::db::schema_sqlite::post_correspondence::dsl::*;
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
        run_blocking(&self.db_path, move |conn| {
            diesel::delete(
                post_correspondence::table.filter(post_correspondence::local_post_id.eq(post_id)),
            )
            .execute(conn)?;
            Ok(())
        })
        .await
    }
}

pub struct SqliteChannelLinkStore {
    db_path: Arc<String>,
}

impl SqliteChannelLinkStore {
    pub fn new(db_path: Arc<String>) -> Self {
        Self { db_path }
    }
}

#[async_trait]
impl super::ChannelLinkStore for SqliteChannelLinkStore {
    async fn store_channel_link(&self, link: &ChannelLink) -> Result<(), DatabaseError> {
        let row = DbChannelLink::from(link);
        run_blocking(&self.db_path, move |conn| {
            diesel::insert_into(channel_link::table)
                .values(&row)
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn delete_link_by_channel_id(&self, channel_id: &str) -> Result<(), DatabaseError> {
        let channel_id = channel_id.to_string();
        run_blocking(&self.db_path, move |conn| {
            conn.transaction::<_, DatabaseError, _>(|conn| {
                let Some(link) = channel_link::table
                    .filter(channel_link::local_channel_id.eq(&channel_id))
                    .select(DbChannelLink::as_select())
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
        run_blocking(&self.db_path, move |conn| {
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
        run_blocking(&self.db_path, move |conn| {
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
        run_blocking(&self.db_path, move |conn| {
            let rows = channel_link::table
                .order(channel_link::local_channel_id.asc())
                .select(DbChannelLink::as_select())
                .load::<DbChannelLink>(conn)?;
            Ok(rows.into_iter().map(ChannelLink::from).collect())
        })
        .await
    }
}

pub struct SqliteSubscriptionStore {
    db_path: Arc<String>,
}

impl SqliteSubscriptionStore {
    pub fn new(db_path: Arc<String>) -> Self {
        Self { db_path }
    }

    async fn list_by_kind(
        &self,
        kind: SubscriptionKind,
    ) -> Result<Vec<SubscriptionRecord>, DatabaseError> {
        run_blocking(&self.db_path, move |conn| {
            let rows = subscription::table
                .filter(subscription::kind.eq(kind.as_str()))
                .order(subscription::subscription_id.asc())
                .select(DbSubscription::as_select())
                .load::<DbSubscription>(conn)?;
            rows.iter().map(DbSubscription::to_record).collect()
        })
        .await
    }
}

#[async_trait]
impl super::SubscriptionStore for SqliteSubscriptionStore {
    async fn save_channel_subscription(
        &self,
        record: &SubscriptionRecord,
    ) -> Result<(), DatabaseError> {
        let row = DbSubscription::from_record(record);
        run_blocking(&self.db_path, move |conn| {
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
        run_blocking(&self.db_path, move |conn| {
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
        let expires_on = datetime_to_string(&expires_on);
        run_blocking(&self.db_path, move |conn| {
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
        let last_activity_at = datetime_to_string(&last_activity_at);
        run_blocking(&self.db_path, move |conn| {
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
        run_blocking(&self.db_path, move |conn| {
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
        run_blocking(&self.db_path, move |conn| {
            subscription::table
                .filter(subscription::subscription_id.eq(subscription_id))
                .select(DbSubscription::as_select())
                .first::<DbSubscription>(conn)
                .optional()?
                .map(|row| row.to_record())
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

pub struct SqliteUserStore {
    db_path: Arc<String>,
    cipher: Arc<TokenCipher>,
}

impl SqliteUserStore {
    pub fn new(db_path: Arc<String>, cipher: Arc<TokenCipher>) -> Self {
        Self { db_path, cipher }
    }

    fn seal(&self, token: Option<&str>) -> Result<Option<String>, DatabaseError> {
        token
            .map(|plain| {
                self.cipher
                    .encrypt(plain)
                    .map_err(|e| DatabaseError::Query(format!("unable to encrypt token: {e}")))
            })
            .transpose()
    }
}

#[async_trait]
impl super::UserStore for SqliteUserStore {
    async fn set_user_info(
        &self,
        local_id: &str,
        remote_id: &str,
        plain_token: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let local_id = local_id.to_string();
        let remote_id = remote_id.to_string();
        let sealed = self.seal(plain_token)?;
        run_blocking(&self.db_path, move |conn| {
            conn.transaction::<_, DatabaseError, _>(|conn| {
                use crate::db::schema_sqlite::user_linkage::dsl::*;
                let exists = user_linkage
                    .filter(local_user_id.eq(&local_id))
                    .count()
                    .get_result::<i64>(conn)?
                    > 0;
                if exists {
                    diesel::update(user_linkage.filter(local_user_id.eq(&local_id)))
                        .set((remote_user_id.eq(&remote_id), token.eq(&sealed)))
                        .execute(conn)?;
                } else {
                    diesel::insert_into(user_linkage)
                        .values((
                            local_user_id.eq(&local_id),
                            remote_user_id.eq(&remote_id),
                            token.eq(&sealed),
                        ))
                        .execute(conn)?;
                }
                Ok(())
            })
        })
        .await
    }

    async fn get_user_linkage(
        &self,
        local_id: &str,
    ) -> Result<Option<UserLinkage>, DatabaseError> {
        let local_id = local_id.to_string();
        let cipher = self.cipher.clone();
        run_blocking(&self.db_path, move |conn| {
            user_linkage::table
                .filter(user_linkage::local_user_id.eq(local_id))
                .select(DbUserLinkage::as_select())
                .first::<DbUserLinkage>(conn)
                .optional()?
                .map(|row| row.to_linkage(&cipher))
                .transpose()
        })
        .await
    }

    async fn delete_user_info(&self, local_id: &str) -> Result<(), DatabaseError> {
        let local_id = local_id.to_string();
        run_blocking(&self.db_path, move |conn| {
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
        run_blocking(&self.db_path, move |conn| {
            let row = user_linkage::table
                .filter(user_linkage::remote_user_id.eq(remote_id))
                .select(DbUserLinkage::as_select())
                .first::<DbUserLinkage>(conn)
                .optional()?;
            Ok(row
                .map(|row| row.to_linkage(&cipher))
                .transpose()?
                .and_then(|linkage| linkage.token))
        })
        .await
    }

    async fn teams_to_local(&self, remote_id: &str) -> Result<Option<String>, DatabaseError> {
        let remote_id = remote_id.to_string();
        run_blocking(&self.db_path, move |conn| {
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
        run_blocking(&self.db_path, move |conn| {
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
        run_blocking(&self.db_path, move |conn| {
            diesel::update(user_linkage::table.filter(user_linkage::local_user_id.eq_any(local_ids)))
                .set(user_linkage::last_chat_received_at.eq(Some(timestamp)))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn list_connected_users(&self) -> Result<Vec<UserLinkage>, DatabaseError> {
        let cipher = self.cipher.clone();
        run_blocking(&self.db_path, move |conn| {
            let rows = user_linkage::table
                .filter(user_linkage::token.is_not_null())
                .order(user_linkage::local_user_id.asc())
                .select(DbUserLinkage::as_select())
                .load::<DbUserLinkage>(conn)?;
            rows.iter().map(|row| row.to_linkage(&cipher)).collect()
        })
        .await
    }
}

pub struct SqliteInviteStore {
    db_path: Arc<String>,
}

impl SqliteInviteStore {
    pub fn new(db_path: Arc<String>) -> Self {
        Self { db_path }
    }
}

#[async_trait]
impl super::InviteStore for SqliteInviteStore {
    async fn store_invited_user(&self, invited: &InvitedUser) -> Result<(), DatabaseError> {
        let user_id = invited.local_user_id.clone();
        let pending_since = datetime_to_string(&invited.invite_pending_since);
        let last_sent_at = datetime_to_string(&invited.invite_last_sent_at);
        run_blocking(&self.db_path, move |conn| {
            conn.transaction::<_, DatabaseError, _>(|conn| {
                use crate::db::schema_sqlite::invited_user::dsl::*;
                diesel::delete(invited_user.filter(local_user_id.eq(&user_id))).execute(conn)?;
                diesel::insert_into(invited_user)
                    .values((
                        local_user_id.eq(&user_id),
                        invite_pending_since.eq(&pending_since),
                        invite_last_sent_at.eq(&last_sent_at),
                    ))
                    .execute(conn)?;
                Ok(())
            })
        })
        .await
    }

    async fn get_invited_user(
        &self,
        user_id: &str,
    ) -> Result<Option<InvitedUser>, DatabaseError> {
        let user_id = user_id.to_string();
        run_blocking(&self.db_path, move |conn| {
            invited_user::table
                .filter(invited_user::local_user_id.eq(user_id))
                .select(DbInvitedUser::as_select())
                .first::<DbInvitedUser>(conn)
                .optional()?
                .map(|row| row.to_invited_user())
                .transpose()
        })
        .await
    }

    async fn delete_invited_user(&self, user_id: &str) -> Result<(), DatabaseError> {
        let user_id = user_id.to_string();
        run_blocking(&self.db_path, move |conn| {
            diesel::delete(invited_user::table.filter(invited_user::local_user_id.eq(user_id)))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn count_invited_users(&self) -> Result<i64, DatabaseError> {
        run_blocking(&self.db_path, move |conn| {
            Ok(invited_user::table.count().get_result(conn)?)
        })
        .await
    }

    async fn store_whitelist(&self, user_id: &str) -> Result<(), DatabaseError> {
        let user_id = user_id.to_string();
        run_blocking(&self.db_path, move |conn| {
            diesel::insert_or_ignore_into(whitelist::table)
                .values(whitelist::local_user_id.eq(user_id))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn is_user_whitelisted(&self, user_id: &str) -> Result<bool, DatabaseError> {
        let user_id = user_id.to_string();
        run_blocking(&self.db_path, move |conn| {
            let count: i64 = whitelist::table
                .filter(whitelist::local_user_id.eq(user_id))
                .count()
                .get_result(conn)?;
            Ok(count > 0)
        })
        .await
    }

    async fn count_whitelisted(&self) -> Result<i64, DatabaseError> {
        run_blocking(&self.db_path, move |conn| {
            Ok(whitelist::table.count().get_result(conn)?)
        })
        .await
    }

    async fn store_oauth_state(&self, nonce: &str) -> Result<(), DatabaseError> {
        let nonce = nonce.to_string();
        let created_at = datetime_to_string(&Utc::now());
        run_blocking(&self.db_path, move |conn| {
            diesel::insert_into(oauth_state::table)
                .values((
                    oauth_state::nonce.eq(nonce),
                    oauth_state::created_at.eq(created_at),
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
        run_blocking(&self.db_path, move |conn| {
            conn.transaction::<_, DatabaseError, _>(|conn| {
                let created: Option<String> = oauth_state::table
                    .filter(oauth_state::nonce.eq(&nonce))
                    .select(oauth_state::created_at)
                    .first::<String>(conn)
                    .optional()?;
                let Some(created) = created else {
                    return Ok(false);
                };
                diesel::delete(oauth_state::table.filter(oauth_state::nonce.eq(&nonce)))
                    .execute(conn)?;
                Ok(Utc::now() - string_to_datetime(&created)? <= max_age)
            })
        })
        .await
    }

    async fn delete_expired_oauth_states(
        &self,
        max_age: chrono::Duration,
    ) -> Result<usize, DatabaseError> {
        let cutoff = datetime_to_string(&(Utc::now() - max_age));
        run_blocking(&self.db_path, move |conn| {
            Ok(
                diesel::delete(oauth_state::table.filter(oauth_state::created_at.lt(cutoff)))
                    .execute(conn)?,
            )
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, TimeZone, Utc};
    use tempfile::TempDir;

    use crate::db::{
        ChannelLink, DatabaseError, DatabaseManager, PostCorrespondence, SubscriptionRecord,
    };
    use crate::utils::TokenCipher;

    async fn manager() -> (TempDir, DatabaseManager) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.db").to_string_lossy().to_string();
        let db = DatabaseManager::sqlite(path, Arc::new(TokenCipher::new("test-key")));
        db.migrate().await.unwrap();
        (dir, db)
    }

    fn link(local_channel: &str, remote_channel: &str) -> ChannelLink {
        ChannelLink {
            local_team_id: "team-local".to_string(),
            local_channel_id: local_channel.to_string(),
            remote_team_id: "team-remote".to_string(),
            remote_channel_id: remote_channel.to_string(),
            creator_user_id: "creator".to_string(),
        }
    }

    #[tokio::test]
    async fn link_posts_rejects_second_local_post_for_same_message() {
        let (_dir, db) = manager().await;
        let posts = db.post_store();

        posts
            .link_posts(&PostCorrespondence::new("p1", "m1", "chat1", 10))
            .await
            .unwrap();
        let err = posts
            .link_posts(&PostCorrespondence::new("p2", "m1", "chat1", 20))
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Conflict(_)));

        let stored = posts.get_by_remote("chat1", "m1").await.unwrap().unwrap();
        assert_eq!(stored.local_post_id, "p1");
        assert!(posts.get_by_local("p2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn last_update_never_moves_backward() {
        let (_dir, db) = manager().await;
        let posts = db.post_store();

        posts
            .link_posts(&PostCorrespondence::new("p1", "m1", "chat1", 100))
            .await
            .unwrap();
        posts.set_last_update_at_by_local("p1", 50).await.unwrap();
        posts.set_last_update_at_by_remote("m1", 70).await.unwrap();
        posts
            .link_posts(&PostCorrespondence::new("p1", "m1", "chat1", 80))
            .await
            .unwrap();
        assert_eq!(
            posts.get_by_local("p1").await.unwrap().unwrap().last_update_at,
            100
        );

        posts.set_last_update_at_by_remote("m1", 150).await.unwrap();
        assert_eq!(
            posts.get_by_local("p1").await.unwrap().unwrap().last_update_at,
            150
        );
    }

    #[tokio::test]
    async fn deleting_link_removes_channel_subscription() {
        let (_dir, db) = manager().await;
        let links = db.link_store();
        let subscriptions = db.subscription_store();
        let expires = Utc::now() + Duration::hours(1);

        links.store_channel_link(&link("c1", "rc1")).await.unwrap();
        subscriptions
            .save_channel_subscription(&SubscriptionRecord::channel(
                "sub-1",
                "team-remote",
                "rc1",
                "secret",
                expires,
            ))
            .await
            .unwrap();

        links.delete_link_by_channel_id("c1").await.unwrap();

        assert!(links.get_link_by_channel_id("c1").await.unwrap().is_none());
        assert!(subscriptions.get_subscription("sub-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remote_channel_is_linked_at_most_once() {
        let (_dir, db) = manager().await;
        let links = db.link_store();

        links.store_channel_link(&link("c1", "rc1")).await.unwrap();
        let err = links.store_channel_link(&link("c2", "rc1")).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Conflict(_)));

        let found = links
            .get_link_by_remote_channel_id("team-remote", "rc1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.local_channel_id, "c1");
    }

    #[tokio::test]
    async fn saving_global_subscription_replaces_previous() {
        let (_dir, db) = manager().await;
        let subscriptions = db.subscription_store();
        let expires = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();

        subscriptions
            .save_global_subscription(&SubscriptionRecord::global("g1", "s1", expires))
            .await
            .unwrap();
        subscriptions
            .save_global_subscription(&SubscriptionRecord::global("g2", "s2", expires))
            .await
            .unwrap();

        let globals = subscriptions.list_global_subscriptions().await.unwrap();
        assert_eq!(globals.len(), 1);
        assert_eq!(globals[0].subscription_id, "g2");
        assert_eq!(globals[0].expires_on, expires);
    }

    #[tokio::test]
    async fn tokens_are_stored_encrypted_and_read_back() {
        let (_dir, db) = manager().await;
        let users = db.user_store();

        users
            .set_user_info("local-1", "remote-1", Some("access-token"))
            .await
            .unwrap();
        assert_eq!(
            users.get_token_for_local_user("local-1").await.unwrap().as_deref(),
            Some("access-token")
        );
        assert_eq!(
            users.get_token_for_remote_user("remote-1").await.unwrap().as_deref(),
            Some("access-token")
        );
        assert_eq!(
            users.teams_to_local("remote-1").await.unwrap().as_deref(),
            Some("local-1")
        );

        users.set_user_info("local-1", "remote-1", None).await.unwrap();
        assert!(!users.is_user_connected("local-1").await.unwrap());
        assert_eq!(
            users.local_to_teams("local-1").await.unwrap().as_deref(),
            Some("remote-1")
        );
    }

    #[tokio::test]
    async fn oauth_state_is_single_use() {
        let (_dir, db) = manager().await;
        let invites = db.invite_store();

        invites.store_oauth_state("nonce-1").await.unwrap();
        assert!(
            invites
                .verify_and_delete_oauth_state("nonce-1", Duration::minutes(5))
                .await
                .unwrap()
        );
        assert!(
            !invites
                .verify_and_delete_oauth_state("nonce-1", Duration::minutes(5))
                .await
                .unwrap()
        );
    }
}
