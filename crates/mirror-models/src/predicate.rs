//! Fact predicate vocabulary.
//!
//! Predicates are a closed set with an [`Predicate::Other`] fallback. The
//! single-valued, inverse and connection tables below are exhaustive
//! matches, so adding a predicate forces a decision in each of them.

use serde::{Deserialize, Serialize};

/// Predicate of a subject-predicate-object fact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Predicate {
    WorksAt,
    Role,
    JobTitle,
    Relationship,
    Location,
    LivesIn,
    Likes,
    Dislikes,
    Expertise,
    StudiedAt,
    Owns,
    MemberOf,
    BelongsTo,
    ReportsTo,
    Manages,
    MarriedTo,
    Age,
    Knows,
    FriendOf,
    SpouseOf,
    SiblingOf,
    ParentOf,
    ChildOf,
    PartnerOf,
    Other(String),
}

impl Predicate {
    pub fn as_str(&self) -> &str {
        match self {
            Predicate::WorksAt => "works_at",
            Predicate::Role => "role",
            Predicate::JobTitle => "job_title",
            Predicate::Relationship => "relationship",
            Predicate::Location => "location",
            Predicate::LivesIn => "lives_in",
            Predicate::Likes => "likes",
            Predicate::Dislikes => "dislikes",
            Predicate::Expertise => "expertise",
            Predicate::StudiedAt => "studied_at",
            Predicate::Owns => "owns",
            Predicate::MemberOf => "member_of",
            Predicate::BelongsTo => "belongs_to",
            Predicate::ReportsTo => "reports_to",
            Predicate::Manages => "manages",
            Predicate::MarriedTo => "married_to",
            Predicate::Age => "age",
            Predicate::Knows => "knows",
            Predicate::FriendOf => "friend_of",
            Predicate::SpouseOf => "spouse_of",
            Predicate::SiblingOf => "sibling_of",
            Predicate::ParentOf => "parent_of",
            Predicate::ChildOf => "child_of",
            Predicate::PartnerOf => "partner_of",
            Predicate::Other(s) => s,
        }
    }

    /// Parse a predicate label. Common synonyms map to their canonical
    /// variant; anything else becomes [`Predicate::Other`].
    pub fn parse(s: &str) -> Self {
        let key = s.trim().to_lowercase().replace([' ', '-'], "_");
        match key.as_str() {
            "works_at" | "company" | "employer" => Predicate::WorksAt,
            "role" => Predicate::Role,
            "job_title" | "title" => Predicate::JobTitle,
            "relationship" => Predicate::Relationship,
            "location" => Predicate::Location,
            "lives_in" => Predicate::LivesIn,
            "likes" => Predicate::Likes,
            "dislikes" => Predicate::Dislikes,
            "expertise" => Predicate::Expertise,
            "studied_at" | "school" | "alma_mater" => Predicate::StudiedAt,
            "owns" => Predicate::Owns,
            "member_of" => Predicate::MemberOf,
            "belongs_to" => Predicate::BelongsTo,
            "reports_to" | "manager" => Predicate::ReportsTo,
            "manages" => Predicate::Manages,
            "married_to" => Predicate::MarriedTo,
            "age" => Predicate::Age,
            "knows" => Predicate::Knows,
            "friend_of" | "friend" => Predicate::FriendOf,
            "spouse_of" | "spouse" => Predicate::SpouseOf,
            "sibling_of" | "sibling" => Predicate::SiblingOf,
            "parent_of" | "parent" => Predicate::ParentOf,
            "child_of" | "child" => Predicate::ChildOf,
            "partner_of" | "partner" => Predicate::PartnerOf,
            _ => Predicate::Other(key),
        }
    }

    /// Predicates for which an entity holds at most one current value.
    pub fn is_single_valued(&self) -> bool {
        match self {
            Predicate::WorksAt
            | Predicate::JobTitle
            | Predicate::Role
            | Predicate::Location
            | Predicate::LivesIn
            | Predicate::MarriedTo
            | Predicate::SpouseOf
            | Predicate::Age
            | Predicate::ReportsTo => true,
            Predicate::Relationship
            | Predicate::Likes
            | Predicate::Dislikes
            | Predicate::Expertise
            | Predicate::StudiedAt
            | Predicate::Owns
            | Predicate::MemberOf
            | Predicate::BelongsTo
            | Predicate::Manages
            | Predicate::Knows
            | Predicate::FriendOf
            | Predicate::SiblingOf
            | Predicate::ParentOf
            | Predicate::ChildOf
            | Predicate::PartnerOf
            | Predicate::Other(_) => false,
        }
    }

    /// Predicate that holds in the opposite direction, if any.
    /// Symmetric predicates return themselves.
    pub fn inverse(&self) -> Option<Predicate> {
        match self {
            Predicate::ReportsTo => Some(Predicate::Manages),
            Predicate::Manages => Some(Predicate::ReportsTo),
            Predicate::ParentOf => Some(Predicate::ChildOf),
            Predicate::ChildOf => Some(Predicate::ParentOf),
            Predicate::Knows
            | Predicate::FriendOf
            | Predicate::SpouseOf
            | Predicate::MarriedTo
            | Predicate::SiblingOf
            | Predicate::PartnerOf => Some(self.clone()),
            Predicate::WorksAt
            | Predicate::Role
            | Predicate::JobTitle
            | Predicate::Relationship
            | Predicate::Location
            | Predicate::LivesIn
            | Predicate::Likes
            | Predicate::Dislikes
            | Predicate::Expertise
            | Predicate::StudiedAt
            | Predicate::Owns
            | Predicate::MemberOf
            | Predicate::BelongsTo
            | Predicate::Age
            | Predicate::Other(_) => None,
        }
    }

    /// How a fact with this predicate connects its subject to other
    /// entities during graph traversal.
    pub fn connection(&self) -> Option<ConnectionKind> {
        match self {
            Predicate::WorksAt => Some(ConnectionKind::Colleague),
            Predicate::Knows
            | Predicate::FriendOf
            | Predicate::SpouseOf
            | Predicate::MarriedTo
            | Predicate::SiblingOf
            | Predicate::ParentOf
            | Predicate::ChildOf
            | Predicate::PartnerOf => Some(ConnectionKind::Direct),
            Predicate::ReportsTo | Predicate::Manages => Some(ConnectionKind::Hierarchy),
            Predicate::MemberOf | Predicate::BelongsTo => Some(ConnectionKind::CoMembership),
            Predicate::StudiedAt => Some(ConnectionKind::Alumni),
            Predicate::Role
            | Predicate::JobTitle
            | Predicate::Relationship
            | Predicate::Location
            | Predicate::LivesIn
            | Predicate::Likes
            | Predicate::Dislikes
            | Predicate::Expertise
            | Predicate::Owns
            | Predicate::Age
            | Predicate::Other(_) => None,
        }
    }

    /// All predicates sharing a connection kind.
    pub fn with_connection(kind: ConnectionKind) -> &'static [Predicate] {
        match kind {
            ConnectionKind::Colleague => &[Predicate::WorksAt],
            ConnectionKind::Direct => &[
                Predicate::Knows,
                Predicate::FriendOf,
                Predicate::SpouseOf,
                Predicate::MarriedTo,
                Predicate::SiblingOf,
                Predicate::ParentOf,
                Predicate::ChildOf,
                Predicate::PartnerOf,
            ],
            ConnectionKind::Hierarchy => &[Predicate::ReportsTo, Predicate::Manages],
            ConnectionKind::CoMembership => &[Predicate::MemberOf, Predicate::BelongsTo],
            ConnectionKind::Alumni => &[Predicate::StudiedAt],
        }
    }
}

impl From<String> for Predicate {
    fn from(s: String) -> Self {
        Predicate::parse(&s)
    }
}

impl From<Predicate> for String {
    fn from(p: Predicate) -> Self {
        p.as_str().to_string()
    }
}

impl std::fmt::Display for Predicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Relationship label attached to edges discovered by traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionKind {
    /// Shared employer
    Colleague,
    /// Family, friends, partners
    Direct,
    /// Reporting line
    Hierarchy,
    /// Shared group membership
    CoMembership,
    /// Shared school
    Alumni,
}

impl ConnectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionKind::Colleague => "colleague",
            ConnectionKind::Direct => "direct",
            ConnectionKind::Hierarchy => "hierarchy",
            ConnectionKind::CoMembership => "co_member",
            ConnectionKind::Alumni => "alumni",
        }
    }

    /// Whether two subjects are connected by sharing the same object
    /// (same employer, group or school) rather than by naming each other.
    pub fn shares_object(&self) -> bool {
        matches!(
            self,
            ConnectionKind::Colleague | ConnectionKind::CoMembership | ConnectionKind::Alumni
        )
    }
}

impl std::fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
