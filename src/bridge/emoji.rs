use std::collections::HashMap;

/// Shortcode to unicode pairs understood by both platforms.
const EMOJI_ALIASES: &[(&str, &str)] = &[
    ("+1", "👍"),
    ("thumbsup", "👍"),
    ("-1", "👎"),
    ("thumbsdown", "👎"),
    ("smile", "😄"),
    ("smiley", "😃"),
    ("grinning", "😀"),
    ("grin", "😁"),
    ("laughing", "😆"),
    ("sweat_smile", "😅"),
    ("joy", "😂"),
    ("rofl", "🤣"),
    ("slightly_smiling_face", "🙂"),
    ("upside_down_face", "🙃"),
    ("wink", "😉"),
    ("blush", "😊"),
    ("innocent", "😇"),
    ("heart_eyes", "😍"),
    ("kissing_heart", "😘"),
    ("yum", "😋"),
    ("stuck_out_tongue", "😛"),
    ("stuck_out_tongue_winking_eye", "😜"),
    ("thinking_face", "🤔"),
    ("neutral_face", "😐"),
    ("expressionless", "😑"),
    ("unamused", "😒"),
    ("roll_eyes", "🙄"),
    ("grimacing", "😬"),
    ("relieved", "😌"),
    ("pensive", "😔"),
    ("sleepy", "😪"),
    ("sleeping", "😴"),
    ("mask", "😷"),
    ("sunglasses", "😎"),
    ("nerd_face", "🤓"),
    ("confused", "😕"),
    ("worried", "😟"),
    ("slightly_frowning_face", "🙁"),
    ("open_mouth", "😮"),
    ("hushed", "😯"),
    ("astonished", "😲"),
    ("flushed", "😳"),
    ("fearful", "😨"),
    ("cold_sweat", "😰"),
    ("cry", "😢"),
    ("sob", "😭"),
    ("scream", "😱"),
    ("confounded", "😖"),
    ("persevere", "😣"),
    ("disappointed", "😞"),
    ("sweat", "😓"),
    ("weary", "😩"),
    ("tired_face", "😫"),
    ("triumph", "😤"),
    ("rage", "😡"),
    ("angry", "😠"),
    ("smiling_imp", "😈"),
    ("skull", "💀"),
    ("poop", "💩"),
    ("clown_face", "🤡"),
    ("ghost", "👻"),
    ("alien", "👽"),
    ("robot", "🤖"),
    ("heart", "❤️"),
    ("orange_heart", "🧡"),
    ("yellow_heart", "💛"),
    ("green_heart", "💚"),
    ("blue_heart", "💙"),
    ("purple_heart", "💜"),
    ("broken_heart", "💔"),
    ("sparkling_heart", "💖"),
    ("100", "💯"),
    ("boom", "💥"),
    ("fire", "🔥"),
    ("sparkles", "✨"),
    ("star", "⭐"),
    ("tada", "🎉"),
    ("confetti_ball", "🎊"),
    ("gift", "🎁"),
    ("trophy", "🏆"),
    ("rocket", "🚀"),
    ("eyes", "👀"),
    ("wave", "👋"),
    ("ok_hand", "👌"),
    ("v", "✌️"),
    ("crossed_fingers", "🤞"),
    ("muscle", "💪"),
    ("pray", "🙏"),
    ("clap", "👏"),
    ("raised_hands", "🙌"),
    ("point_up", "☝️"),
    ("point_right", "👉"),
    ("point_left", "👈"),
    ("facepalm", "🤦"),
    ("shrug", "🤷"),
    ("white_check_mark", "✅"),
    ("heavy_check_mark", "✔️"),
    ("x", "❌"),
    ("warning", "⚠️"),
    ("question", "❓"),
    ("exclamation", "❗"),
    ("bulb", "💡"),
    ("memo", "📝"),
    ("coffee", "☕"),
    ("beer", "🍺"),
    ("pizza", "🍕"),
    ("cake", "🍰"),
    ("sun_with_face", "🌞"),
    ("rainbow", "🌈"),
    ("zap", "⚡"),
    ("dog", "🐶"),
    ("cat", "🐱"),
    ("see_no_evil", "🙈"),
    ("hugging_face", "🤗"),
    ("partying_face", "🥳"),
];

/// Reactions that the remote side names by keyword instead of unicode.
const REMOTE_REACTION_NAMES: &[(&str, &str)] = &[
    ("like", "+1"),
    ("sad", "cry"),
    ("angry", "angry"),
    ("laugh", "laughing"),
    ("heart", "heart"),
    ("surprised", "open_mouth"),
    ("checkmarkbutton", "white_check_mark"),
];

/// Immutable emoji lookup built once and shared by every handler.
#[derive(Debug, Clone)]
pub struct EmojiTable {
    to_unicode: HashMap<&'static str, &'static str>,
    to_name: HashMap<&'static str, &'static str>,
}

impl Default for EmojiTable {
    fn default() -> Self {
        Self::new()
    }
}

impl EmojiTable {
    pub fn new() -> Self {
        let mut to_unicode = HashMap::new();
        let mut to_name = HashMap::new();
        for (alias, unicode) in EMOJI_ALIASES {
            to_unicode.insert(*alias, *unicode);
            // The first alias listed for a glyph is the canonical name.
            to_name.entry(*unicode).or_insert(*alias);
        }
        for (remote, alias) in REMOTE_REACTION_NAMES {
            to_name.insert(*remote, *alias);
        }
        Self {
            to_unicode,
            to_name,
        }
    }

    /// Unicode glyph for a local emoji name. Unknown names are passed through.
    pub fn to_remote(&self, emoji_name: &str) -> String {
        self.to_unicode
            .get(emoji_name)
            .map_or_else(|| emoji_name.to_string(), |unicode| unicode.to_string())
    }

    /// Local emoji name for a remote reaction, which is either a glyph or a
    /// legacy keyword.
    pub fn to_local(&self, reaction: &str) -> Option<&'static str> {
        self.to_name
            .get(reaction)
            .or_else(|| self.to_name.get(reaction.trim_end_matches('\u{fe0f}')))
            .copied()
    }
}
