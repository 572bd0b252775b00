//! Notification policy: mutes the local copies of linked channels and chats
//! for users who read them in Microsoft Teams.
//!
//! A user's effective automute is on iff they are connected and their
//! primary platform is `msteams`. The `automute_enabled` preference records
//! the state last applied so toggles are idempotent.

use std::collections::HashMap;

use tracing::{debug, error, info, warn};

use super::BridgeCore;
use crate::host::{Channel, ChannelMemberIdentifier, ChannelType, Preference};
use crate::utils::SyncError;

pub const PREF_PRIMARY_PLATFORM: &str = "primary_platform";
pub const PREF_NOTIFICATIONS: &str = "notifications";
pub const PREF_AUTOMUTE_ENABLED: &str = "automute_enabled";

pub const PREF_VALUE_ON: &str = "on";
pub const PLATFORM_MSTEAMS: &str = "msteams";
pub const PLATFORM_MATTERMOST: &str = "mattermost";

pub const NOTIFY_PROP_MARK_UNREAD: &str = "mark_unread";
pub const NOTIFY_PROP_AUTOMUTED: &str = "msteams_automute";

/// Members per notify-prop patch and per membership page.
pub const AUTOMUTE_PAGE_SIZE: usize = 200;

const TEAMS_PRIMARY_MESSAGE: &str = "You have chosen Microsoft Teams as your primary platform. \
Linked channels and chats in Mattermost are now muted so you are only notified in Microsoft Teams.";
const MATTERMOST_PRIMARY_MESSAGE: &str = "You have chosen Mattermost as your primary platform. \
Linked channels and chats in Mattermost are no longer muted.";

pub fn automute_notify_props(enabled: bool) -> HashMap<String, String> {
    let (mark_unread, automuted) = if enabled {
        ("mention", "true")
    } else {
        ("all", "false")
    };
    HashMap::from([
        (NOTIFY_PROP_MARK_UNREAD.to_string(), mark_unread.to_string()),
        (NOTIFY_PROP_AUTOMUTED.to_string(), automuted.to_string()),
    ])
}

impl BridgeCore {
    async fn plugin_preference(&self, user_id: &str, name: &str) -> Option<String> {
        let category = self.config().preference_category();
        match self.host().get_preference(user_id, &category, name).await {
            Ok(value) => value,
            Err(e) => {
                debug!("unable to read preference user_id={} name={} error={}", user_id, name, e);
                None
            }
        }
    }

    pub async fn notifications_enabled(&self, user_id: &str) -> bool {
        self.plugin_preference(user_id, PREF_NOTIFICATIONS).await.as_deref() == Some(PREF_VALUE_ON)
    }

    /// Unset preferences default to Mattermost being primary.
    pub async fn is_primary_platform_teams(&self, user_id: &str) -> bool {
        self.plugin_preference(user_id, PREF_PRIMARY_PLATFORM).await.as_deref()
            == Some(PLATFORM_MSTEAMS)
    }

    pub async fn automute_is_enabled_for_user(&self, user_id: &str) -> bool {
        self.plugin_preference(user_id, PREF_AUTOMUTE_ENABLED).await.as_deref() == Some("true")
    }

    pub async fn is_user_connected(&self, user_id: &str) -> Result<bool, SyncError> {
        Ok(self.users().is_user_connected(user_id).await?)
    }

    async fn store_automute_enabled(&self, user_id: &str, enabled: bool) -> Result<(), SyncError> {
        let preference = Preference {
            user_id: user_id.to_string(),
            category: self.config().preference_category(),
            name: PREF_AUTOMUTE_ENABLED.to_string(),
            value: enabled.to_string(),
        };
        self.host().update_preferences(user_id, &[preference]).await?;
        Ok(())
    }

    /// Mutes or unmutes every automutable channel of the user. Returns
    /// `false` when the recorded state already matches.
    pub async fn set_automute_enabled_for_user(
        &self,
        user_id: &str,
        enabled: bool,
    ) -> Result<bool, SyncError> {
        if self.automute_is_enabled_for_user(user_id).await == enabled {
            return Ok(false);
        }

        let mut members = Vec::new();
        for channel in self.host().get_channels_for_user(user_id).await? {
            if self.can_automute_channel(&channel, user_id).await? {
                members.push(ChannelMemberIdentifier {
                    channel_id: channel.id,
                    user_id: user_id.to_string(),
                });
            }
        }

        self.set_channel_members_automuted(&members, enabled).await?;
        self.store_automute_enabled(user_id, enabled).await?;
        info!(
            "automute updated user_id={} enabled={} channels={}",
            user_id,
            enabled,
            members.len()
        );
        Ok(true)
    }

    pub async fn set_channel_members_automuted(
        &self,
        members: &[ChannelMemberIdentifier],
        enabled: bool,
    ) -> Result<(), SyncError> {
        let props = automute_notify_props(enabled);
        for page in members.chunks(AUTOMUTE_PAGE_SIZE) {
            self.host()
                .patch_channel_members_notifications(page, &props)
                .await?;
        }
        Ok(())
    }

    /// Group chats always qualify. Direct chats qualify unless the other
    /// side is a bot or a guest, or the chat is a self-DM. Other channels
    /// qualify only while linked.
    pub async fn can_automute_channel(
        &self,
        channel: &Channel,
        user_id: &str,
    ) -> Result<bool, SyncError> {
        match channel.channel_type {
            ChannelType::Group => Ok(true),
            ChannelType::Direct => {
                let members = self
                    .host()
                    .get_channel_members(&channel.id, 0, AUTOMUTE_PAGE_SIZE)
                    .await?;
                let others: Vec<_> = members.iter().filter(|m| m.user_id != user_id).collect();
                if others.is_empty() || members.len() < 2 {
                    return Ok(false);
                }
                for member in others {
                    let user = self.host().get_user(&member.user_id).await?;
                    if user.is_bot || user.is_guest() {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            ChannelType::Open | ChannelType::Private => Ok(self
                .links()
                .get_link_by_channel_id(&channel.id)
                .await?
                .is_some()),
        }
    }

    pub async fn update_automuting_on_user_joined_channel(
        &self,
        user_id: &str,
        channel_id: &str,
    ) -> Result<bool, SyncError> {
        if !self.automute_is_enabled_for_user(user_id).await {
            return Ok(false);
        }

        let channel = self.host().get_channel(channel_id).await?;
        if !self.can_automute_channel(&channel, user_id).await? {
            return Ok(false);
        }

        let member = ChannelMemberIdentifier {
            channel_id: channel_id.to_string(),
            user_id: user_id.to_string(),
        };
        self.set_channel_members_automuted(&[member], true).await?;
        Ok(true)
    }

    /// Fresh channels cannot be linked yet, so only chats are considered.
    pub async fn update_automuting_on_channel_created(
        &self,
        channel: &Channel,
    ) -> Result<(), SyncError> {
        if !channel.is_direct_or_group() {
            return Ok(());
        }
        if !self.can_automute_channel(channel, "").await? {
            return Ok(());
        }
        self.update_automuting_for_channel_members(&channel.id, true)
            .await
    }

    /// Mutes the channel for every member with automute enabled, even
    /// members who unmuted it by hand.
    pub async fn update_automuting_on_channel_linked(
        &self,
        channel_id: &str,
    ) -> Result<(), SyncError> {
        self.update_automuting_for_channel_members(channel_id, true)
            .await
    }

    pub async fn update_automuting_on_channel_unlinked(
        &self,
        channel_id: &str,
    ) -> Result<(), SyncError> {
        self.update_automuting_for_channel_members(channel_id, false)
            .await
    }

    async fn update_automuting_for_channel_members(
        &self,
        channel_id: &str,
        enabled: bool,
    ) -> Result<(), SyncError> {
        let mut to_update = Vec::new();
        let mut page = 0;
        loop {
            let members = self
                .host()
                .get_channel_members(channel_id, page, AUTOMUTE_PAGE_SIZE)
                .await?;
            for member in &members {
                if self.automute_is_enabled_for_user(&member.user_id).await {
                    to_update.push(ChannelMemberIdentifier {
                        channel_id: channel_id.to_string(),
                        user_id: member.user_id.clone(),
                    });
                }
            }
            if members.len() < AUTOMUTE_PAGE_SIZE {
                break;
            }
            page += 1;
        }

        if to_update.is_empty() {
            return Ok(());
        }
        self.set_channel_members_automuted(&to_update, enabled)
            .await
    }

    /// Applies primary platform and notification preference changes.
    pub async fn update_automuting_on_preferences_changed(&self, preferences: &[Preference]) {
        let category = self.config().preference_category();
        for preference in preferences.iter().filter(|p| p.category == category) {
            let user_id = preference.user_id.as_str();
            let connected = match self.is_user_connected(user_id).await {
                Ok(connected) => connected,
                Err(e) => {
                    warn!("unable to determine if user is connected user_id={} error={}", user_id, e);
                    continue;
                }
            };

            let result = match (preference.name.as_str(), preference.value.as_str()) {
                (PREF_PRIMARY_PLATFORM, PLATFORM_MSTEAMS) => {
                    if !connected {
                        continue;
                    }
                    self.notify_user(user_id, TEAMS_PRIMARY_MESSAGE).await;
                    self.set_automute_enabled_for_user(user_id, true).await
                }
                (PREF_PRIMARY_PLATFORM, PLATFORM_MATTERMOST) => {
                    if connected {
                        self.notify_user(user_id, MATTERMOST_PRIMARY_MESSAGE).await;
                    }
                    self.set_automute_enabled_for_user(user_id, false).await
                }
                (PREF_NOTIFICATIONS, _) => {
                    let effective = connected && self.is_primary_platform_teams(user_id).await;
                    self.set_automute_enabled_for_user(user_id, effective).await
                }
                _ => continue,
            };

            if let Err(e) = result {
                warn!(
                    "unable to update automute after preference change user_id={} name={} error={}",
                    user_id, preference.name, e
                );
            }
        }
    }

    pub async fn on_connect(&self, user_id: &str) -> Result<bool, SyncError> {
        if !self.is_primary_platform_teams(user_id).await {
            return Ok(false);
        }
        let enabled = self
            .set_automute_enabled_for_user(user_id, true)
            .await
            .inspect_err(|e| {
                error!("unable to enable automute on connect user_id={} error={}", user_id, e)
            })?;
        debug!("automute on connect user_id={} changed={}", user_id, enabled);
        Ok(enabled)
    }

    pub async fn on_disconnect(&self, user_id: &str) -> Result<bool, SyncError> {
        let message = format!(
            "Your connection to Microsoft Teams has been lost. [Click here to reconnect]({}/connect)",
            self.config().base_url()
        );
        self.notify_user(user_id, &message).await;

        let disabled = self
            .set_automute_enabled_for_user(user_id, false)
            .await
            .inspect_err(|e| {
                error!("unable to disable automute on disconnect user_id={} error={}", user_id, e)
            })?;
        debug!("automute on disconnect user_id={} changed={}", user_id, disabled);
        Ok(disabled)
    }

    async fn notify_user(&self, user_id: &str, message: &str) {
        if let Err(e) = self.notifier().notify(user_id, message).await {
            warn!("unable to notify user user_id={} error={}", user_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;
    use crate::db::ChannelLink;
    use crate::host::User;
    use crate::testing::{TestBridge, user};

    fn pref(user_id: &str, category: &str, name: &str, value: &str) -> Preference {
        Preference {
            user_id: user_id.to_string(),
            category: category.to_string(),
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    async fn link(env: &TestBridge, channel_id: &str) {
        env.bridge
            .links()
            .store_channel_link(&ChannelLink {
                local_team_id: "team".to_string(),
                local_channel_id: channel_id.to_string(),
                remote_team_id: "RT".to_string(),
                remote_channel_id: format!("R{channel_id}"),
                creator_user_id: "u".to_string(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn first_notifications_on_automutes_every_channel() {
        let env = TestBridge::new().await;
        let category = env.bridge.config().preference_category();
        env.connect_user("u", "user", "ru").await;
        env.host.set_preference("u", &category, PREF_PRIMARY_PLATFORM, PLATFORM_MSTEAMS);

        for channel in ["linked1", "linked2"] {
            env.host.add_channel(channel, "team", ChannelType::Open, &["u"]);
            link(&env, channel).await;
        }
        env.host.add_channel("unlinked", "team", ChannelType::Open, &["u"]);
        for (i, peer) in ["p1", "p2", "p3"].into_iter().enumerate() {
            env.host.add_user(user(peer, peer));
            env.host
                .add_channel(&format!("dm{i}"), "", ChannelType::Direct, &["u", peer]);
        }

        env.host.set_preference("u", &category, PREF_NOTIFICATIONS, PREF_VALUE_ON);
        env.bridge
            .update_automuting_on_preferences_changed(&[pref(
                "u",
                &category,
                PREF_NOTIFICATIONS,
                PREF_VALUE_ON,
            )])
            .await;

        let patches = env.host.notify_patches();
        assert_eq!(patches.len(), 1);
        let (members, props) = &patches[0];
        assert_eq!(members.len(), 5);
        assert_eq!(props.get(NOTIFY_PROP_MARK_UNREAD).map(String::as_str), Some("mention"));
        assert_eq!(props.get(NOTIFY_PROP_AUTOMUTED).map(String::as_str), Some("true"));
        assert_eq!(
            env.host.preference("u", &category, PREF_AUTOMUTE_ENABLED).as_deref(),
            Some("true")
        );

        assert!(!env.bridge.set_automute_enabled_for_user("u", true).await.unwrap());
        assert_eq!(env.host.notify_patches().len(), 1);
    }

    #[test_case(1, 1; "single channel")]
    #[test_case(200, 1; "one full page")]
    #[test_case(201, 2; "one over a page")]
    #[test_case(450, 3; "three pages")]
    #[tokio::test]
    async fn patches_are_paged(channels: usize, calls: usize) {
        let env = TestBridge::new().await;
        env.host.add_user(user("u", "user"));
        for i in 0..channels {
            env.host
                .add_channel(&format!("gm{i:04}"), "", ChannelType::Group, &["u", "x", "y"]);
        }

        assert!(env.bridge.set_automute_enabled_for_user("u", true).await.unwrap());
        let patches = env.host.notify_patches();
        assert_eq!(patches.len(), calls);
        assert_eq!(patches.iter().map(|(m, _)| m.len()).sum::<usize>(), channels);
    }

    #[tokio::test]
    async fn direct_channels_with_bots_guests_or_self_are_skipped() {
        let env = TestBridge::new().await;
        env.host.add_user(user("u", "user"));
        env.host.add_user(User {
            is_bot: true,
            ..user("robot", "robot")
        });
        env.host.add_user(User {
            roles: "system_user system_guest".to_string(),
            ..user("guest", "guest")
        });
        env.host.add_user(user("peer", "peer"));
        env.host.add_channel("d-bot", "", ChannelType::Direct, &["u", "robot"]);
        env.host.add_channel("d-guest", "", ChannelType::Direct, &["u", "guest"]);
        env.host.add_channel("d-self", "", ChannelType::Direct, &["u"]);
        env.host.add_channel("d-peer", "", ChannelType::Direct, &["u", "peer"]);

        for (channel_id, expected) in [
            ("d-bot", false),
            ("d-guest", false),
            ("d-self", false),
            ("d-peer", true),
        ] {
            let channel = env.host.state().channels[channel_id].clone();
            assert_eq!(
                env.bridge.can_automute_channel(&channel, "u").await.unwrap(),
                expected,
                "{channel_id}"
            );
        }
    }

    #[tokio::test]
    async fn linking_and_unlinking_follow_enabled_members() {
        let env = TestBridge::new().await;
        let category = env.bridge.config().preference_category();
        env.host.add_channel("c1", "team", ChannelType::Open, &["muted", "plain"]);
        env.host.set_preference("muted", &category, PREF_AUTOMUTE_ENABLED, "true");

        env.bridge.update_automuting_on_channel_linked("c1").await.unwrap();
        assert_eq!(env.host.member_props("c1", "muted")[NOTIFY_PROP_AUTOMUTED], "true");
        assert!(env.host.member_props("c1", "plain").is_empty());

        env.bridge.update_automuting_on_channel_unlinked("c1").await.unwrap();
        assert_eq!(env.host.member_props("c1", "muted")[NOTIFY_PROP_MARK_UNREAD], "all");
    }

    #[tokio::test]
    async fn joining_a_linked_channel_mutes_the_membership() {
        let env = TestBridge::new().await;
        let category = env.bridge.config().preference_category();
        env.host.add_channel("c1", "team", ChannelType::Open, &["u"]);
        env.host.add_channel("c2", "team", ChannelType::Open, &["u"]);
        link(&env, "c1").await;
        env.host.set_preference("u", &category, PREF_AUTOMUTE_ENABLED, "true");

        assert!(env.bridge.update_automuting_on_user_joined_channel("u", "c1").await.unwrap());
        assert!(!env.bridge.update_automuting_on_user_joined_channel("u", "c2").await.unwrap());
        assert_eq!(env.host.notify_patches().len(), 1);
    }

    #[tokio::test]
    async fn platform_switch_and_disconnect() {
        let env = TestBridge::new().await;
        let category = env.bridge.config().preference_category();
        env.connect_user("u", "user", "ru").await;
        env.host.add_channel("g1", "", ChannelType::Group, &["u", "a", "b"]);

        env.host.set_preference("u", &category, PREF_PRIMARY_PLATFORM, PLATFORM_MSTEAMS);
        env.bridge
            .update_automuting_on_preferences_changed(&[pref(
                "u",
                &category,
                PREF_PRIMARY_PLATFORM,
                PLATFORM_MSTEAMS,
            )])
            .await;
        assert!(env.bridge.automute_is_enabled_for_user("u").await);
        assert_eq!(env.host.created_posts().len(), 1);

        assert!(env.bridge.on_disconnect("u").await.unwrap());
        assert!(!env.bridge.automute_is_enabled_for_user("u").await);
        let posts = env.host.created_posts();
        assert_eq!(
            posts.last().unwrap().message,
            "Your connection to Microsoft Teams has been lost. [Click here to reconnect](https://sync.example.com/connect)"
        );

        assert!(env.bridge.on_connect("u").await.unwrap());
        assert_eq!(env.host.member_props("g1", "u")[NOTIFY_PROP_MARK_UNREAD], "mention");
    }
}
