use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

id_newtype!(OwnerId);
id_newtype!(RowId);
id_newtype!(NodeId);

/// Depth of a report node. The order of the variants is the drill-down order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LevelType {
    Branch,
    Route,
    User,
    Week,
    Day,
}

impl LevelType {
    pub const ALL: [LevelType; 5] = [
        LevelType::Branch,
        LevelType::Route,
        LevelType::User,
        LevelType::Week,
        LevelType::Day,
    ];

    /// Level fetched when a node of this level is expanded. `None` for leaves.
    pub fn next(self) -> Option<LevelType> {
        match self {
            LevelType::Branch => Some(LevelType::Route),
            LevelType::Route => Some(LevelType::User),
            LevelType::User => Some(LevelType::Week),
            LevelType::Week => Some(LevelType::Day),
            LevelType::Day => None,
        }
    }

    pub fn is_leaf(self) -> bool {
        self.next().is_none()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LevelType::Branch => "BRANCH",
            LevelType::Route => "ROUTE",
            LevelType::User => "USER",
            LevelType::Week => "WEEK",
            LevelType::Day => "DAY",
        }
    }

    pub fn parse(raw: &str) -> Option<LevelType> {
        LevelType::ALL
            .into_iter()
            .find(|level| level.as_str().eq_ignore_ascii_case(raw.trim()))
    }
}

impl fmt::Display for LevelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

impl SortDirection {
    pub fn is_ascending(self) -> bool {
        self == SortDirection::Ascending
    }

    pub fn flipped(self) -> Self {
        match self {
            SortDirection::Ascending => SortDirection::Descending,
            SortDirection::Descending => SortDirection::Ascending,
        }
    }
}
