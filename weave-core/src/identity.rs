//! User identity and per-connection presence records.
//!
//! Identity comes from the session provider as a loose
//! `{name, email, avatar}` tuple; this module turns it into the
//! [`UserInfo`] carried in every presence update.

use serde::{Deserialize, Serialize};

use crate::{NodeId, Point};

/// Display palette for collaborators.
pub const USER_COLORS: [&str; 10] = [
    "#FF6B6B", "#4ECDC4", "#FFE66D", "#95E1D3", "#A66CFF",
    "#FF9F43", "#54A0FF", "#5F27CD", "#00D2D3", "#FF6B81",
];

/// Deterministic palette color for a user key (usually the email).
///
/// Uses the 32-bit `h = c + ((h << 5) - h)` string hash over UTF-16
/// code units so every client derives the same color for the same key.
pub fn user_color(key: &str) -> &'static str {
    let mut hash: i32 = 0;
    for unit in key.encode_utf16() {
        hash = (unit as i32).wrapping_add(hash.wrapping_shl(5).wrapping_sub(hash));
    }
    let index = (i64::from(hash).abs() % USER_COLORS.len() as i64) as usize;
    USER_COLORS[index]
}

/// Up to two uppercase initials, one per word.
pub fn initials(name: &str) -> String {
    name.split_whitespace()
        .filter_map(|word| word.chars().next())
        .flat_map(char::to_uppercase)
        .take(2)
        .collect()
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct UserInfo {
    pub name: String,
    pub email: String,
    pub avatar: Option<String>,
    pub color: String,
}

impl UserInfo {
    /// Build from the identity provider's tuple, filling in anonymous
    /// defaults for anything missing.
    pub fn from_identity(
        name: Option<&str>,
        email: Option<&str>,
        avatar: Option<&str>,
    ) -> Self {
        let name = name.filter(|n| !n.is_empty()).unwrap_or("Anonymous");
        let email = email.unwrap_or_default();
        let key = if email.is_empty() { "anonymous" } else { email };
        Self {
            name: name.to_string(),
            email: email.to_string(),
            avatar: avatar.map(str::to_string),
            color: user_color(key).to_string(),
        }
    }

    pub fn anonymous() -> Self {
        Self::from_identity(None, None, None)
    }
}

/// Which surface a collaborator is looking at.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
pub enum View {
    #[default]
    Canvas,
    Document,
}

/// Caret/selection inside a document body.
///
/// `anchor` and `head` are encoded sticky positions from
/// [`crate::RichText::sticky_index`]; each reader resolves them against
/// its own replica of the body.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct TextCursor {
    pub namespace: String,
    pub anchor: Vec<u8>,
    pub head: Vec<u8>,
}

/// Ephemeral per-connection state. Never persisted.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Presence {
    /// Canvas-space pointer position; `None` while not hovering.
    pub cursor: Option<Point>,
    pub selected_node_ids: Vec<NodeId>,
    pub user: UserInfo,
    pub current_view: View,
    pub document_node_id: Option<NodeId>,
    pub text_cursor: Option<TextCursor>,
}

impl Presence {
    pub fn initial(user: UserInfo) -> Self {
        Self {
            cursor: None,
            selected_node_ids: Vec::new(),
            user,
            current_view: View::Canvas,
            document_node_id: None,
            text_cursor: None,
        }
    }
}
