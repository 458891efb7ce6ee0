//! Shared types for the Roomcast messaging platform.
//!
//! These enums are stored in SQLite as lowercase text and travel over the
//! wire in the same form, so every type here carries an `as_str` label and a
//! matching `FromStr` implementation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error returned when a stored or submitted label does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseLabelError {
    /// Which type was being parsed.
    pub kind: &'static str,
    /// The rejected input.
    pub value: String,
}

impl ParseLabelError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// The kind of a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomKind {
    /// A named multi-member room, optionally bound to an external group.
    Group,
    /// A one-to-one conversation.
    Direct,
    /// A discussion room bound to a catalog item.
    Topic,
}

impl RoomKind {
    /// Returns the canonical string label for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Group => "group",
            Self::Direct => "direct",
            Self::Topic => "topic",
        }
    }
}

impl fmt::Display for RoomKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoomKind {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "group" => Ok(Self::Group),
            "direct" => Ok(Self::Direct),
            "topic" => Ok(Self::Topic),
            _ => Err(ParseLabelError::new("room kind", s)),
        }
    }
}

/// A member's role within a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    /// Created the room; may do anything in it.
    Owner,
    /// May manage members and moderate messages.
    Moderator,
    /// May read and post.
    Member,
}

/// Actions that require a role check before they reach the data layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomAction {
    /// Rename the room or change its description.
    UpdateRoom,
    /// Hard-delete the room and everything in it.
    DeleteRoom,
    /// Add or remove other members, or change their role.
    ManageMembers,
    /// Delete messages authored by someone else.
    ModerateMessages,
    /// Send messages and reactions.
    Post,
}

impl MemberRole {
    /// Returns the canonical string label for this role.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Moderator => "moderator",
            Self::Member => "member",
        }
    }

    /// Returns `true` if a member holding this role may perform `action`.
    pub fn permits(self, action: RoomAction) -> bool {
        match self {
            Self::Owner => true,
            Self::Moderator => matches!(
                action,
                RoomAction::ManageMembers | RoomAction::ModerateMessages | RoomAction::Post
            ),
            Self::Member => action == RoomAction::Post,
        }
    }
}

impl fmt::Display for MemberRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemberRole {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "owner" => Ok(Self::Owner),
            "moderator" => Ok(Self::Moderator),
            "member" => Ok(Self::Member),
            _ => Err(ParseLabelError::new("member role", s)),
        }
    }
}

/// The content kind of a stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Plain text.
    #[default]
    Text,
    /// An image attachment with optional caption.
    Image,
    /// A file attachment with optional caption.
    File,
    /// A server-generated notice.
    System,
}

impl MessageKind {
    /// Returns the canonical string label for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::File => "file",
            Self::System => "system",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "file" => Ok(Self::File),
            "system" => Ok(Self::System),
            _ => Err(ParseLabelError::new("message kind", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_parse_back() {
        for kind in [RoomKind::Group, RoomKind::Direct, RoomKind::Topic] {
            assert_eq!(kind.as_str().parse::<RoomKind>().unwrap(), kind);
        }
        for role in [MemberRole::Owner, MemberRole::Moderator, MemberRole::Member] {
            assert_eq!(role.as_str().parse::<MemberRole>().unwrap(), role);
        }
    }

    #[test]
    fn unknown_label_is_rejected() {
        let err = "admin".parse::<MemberRole>().unwrap_err();
        assert_eq!(err.kind, "member role");
        assert_eq!(err.to_string(), "unknown member role: admin");
    }

    #[test]
    fn serde_uses_lowercase_labels() {
        let json = serde_json::to_string(&MessageKind::Image).unwrap();
        assert_eq!(json, "\"image\"");
        let kind: RoomKind = serde_json::from_str("\"topic\"").unwrap();
        assert_eq!(kind, RoomKind::Topic);
    }

    #[test]
    fn role_permissions() {
        assert!(MemberRole::Owner.permits(RoomAction::DeleteRoom));
        assert!(MemberRole::Owner.permits(RoomAction::UpdateRoom));

        assert!(MemberRole::Moderator.permits(RoomAction::ManageMembers));
        assert!(MemberRole::Moderator.permits(RoomAction::ModerateMessages));
        assert!(!MemberRole::Moderator.permits(RoomAction::DeleteRoom));
        assert!(!MemberRole::Moderator.permits(RoomAction::UpdateRoom));

        assert!(MemberRole::Member.permits(RoomAction::Post));
        assert!(!MemberRole::Member.permits(RoomAction::ManageMembers));
        assert!(!MemberRole::Member.permits(RoomAction::ModerateMessages));
    }
}
