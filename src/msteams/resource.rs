use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

use super::models::ActivityIds;

static SEGMENT_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Za-z]+)\('([^']*)'\)$").expect("valid resource segment regex"));

/// Parses a change notification resource such as
/// `teams('T')/channels('C')/messages('M')/replies('R')`. Unknown or
/// malformed segments are ignored, leaving the matching ids empty.
pub fn parse_resource(resource: &str) -> ActivityIds {
    let mut ids = ActivityIds::default();
    for segment in resource.trim_start_matches('/').split('/') {
        let Some(caps) = SEGMENT_REGEX.captures(segment) else {
            continue;
        };
        let value = caps[2].to_string();
        match &caps[1] {
            "chats" => ids.chat_id = value,
            "teams" => ids.team_id = value,
            "channels" => ids.channel_id = value,
            "messages" => ids.message_id = value,
            "replies" => ids.reply_id = value,
            "hostedContents" => ids.hosted_contents_id = value,
            _ => {}
        }
    }
    ids
}

/// Parses a hosted content URL of the form
/// `https://graph.microsoft.com/v1.0/chats/{chat}/messages/{msg}/hostedContents/{hc}/$value`
/// or its channel equivalent.
pub fn parse_hosted_content_url(web_url: &str) -> Option<ActivityIds> {
    let parsed = Url::parse(web_url).ok()?;
    let path = parsed.path();
    let path = path
        .strip_prefix("/beta/")
        .or_else(|| path.strip_prefix("/v1.0/"))
        .unwrap_or(path.trim_start_matches('/'));
    let parts: Vec<&str> = path.split('/').collect();

    let mut ids = ActivityIds::default();
    if parts.first() == Some(&"chats") && parts.len() >= 6 {
        ids.chat_id = parts[1].to_string();
        ids.message_id = parts[3].to_string();
        ids.hosted_contents_id = parts[5].to_string();
        return Some(ids);
    }
    if parts.first() == Some(&"teams") && parts.len() >= 8 {
        ids.team_id = parts[1].to_string();
        ids.channel_id = parts[3].to_string();
        ids.message_id = parts[5].to_string();
        if parts[6] == "replies" {
            if parts.len() < 10 {
                return None;
            }
            ids.reply_id = parts[7].to_string();
            ids.hosted_contents_id = parts[9].to_string();
        } else {
            ids.hosted_contents_id = parts[7].to_string();
        }
        return Some(ids);
    }
    None
}

pub fn is_hosted_content_url(content_url: &str) -> bool {
    content_url.contains("hostedContents") && content_url.ends_with("$value")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_chat_message() {
        let ids = parse_resource("chats('19:abc@thread.v2')/messages('1677')");
        assert_eq!(ids.chat_id, "19:abc@thread.v2");
        assert_eq!(ids.message_id, "1677");
        assert!(ids.team_id.is_empty());
        assert!(ids.is_chat());
    }

    #[test]
    fn parses_channel_reply_with_hosted_content() {
        let ids = parse_resource(
            "teams('T')/channels('C')/messages('M')/replies('R')/hostedContents('H')/$value",
        );
        assert_eq!(ids.team_id, "T");
        assert_eq!(ids.channel_id, "C");
        assert_eq!(ids.message_id, "M");
        assert_eq!(ids.reply_id, "R");
        assert_eq!(ids.hosted_contents_id, "H");
        assert!(!ids.is_chat());
    }

    #[test]
    fn tolerates_leading_slash_and_garbage() {
        let ids = parse_resource("/teams('T')/channels('C')/messages('M')");
        assert_eq!(ids.message_id, "M");

        let ids = parse_resource("nonsense");
        assert_eq!(ids, ActivityIds::default());
    }

    #[test]
    fn parses_hosted_content_urls() {
        let ids = parse_hosted_content_url(
            "https://graph.microsoft.com/v1.0/chats/C1/messages/M1/hostedContents/H1/$value",
        )
        .unwrap();
        assert_eq!(ids.chat_id, "C1");
        assert_eq!(ids.message_id, "M1");
        assert_eq!(ids.hosted_contents_id, "H1");

        let ids = parse_hosted_content_url(
            "https://graph.microsoft.com/beta/teams/T/channels/C/messages/M/replies/R/hostedContents/H/$value",
        )
        .unwrap();
        assert_eq!(ids.team_id, "T");
        assert_eq!(ids.reply_id, "R");
        assert_eq!(ids.hosted_contents_id, "H");

        assert!(parse_hosted_content_url("https://example.com/file.png").is_none());
    }

    #[test]
    fn detects_hosted_content() {
        assert!(is_hosted_content_url(
            "https://graph.microsoft.com/v1.0/chats/C/messages/M/hostedContents/H/$value"
        ));
        assert!(!is_hosted_content_url("https://contoso.sharepoint.com/file.docx"));
    }
}
