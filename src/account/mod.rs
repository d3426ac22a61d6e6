//! Users, API tokens and upstream channels.

mod channel;
mod user;

pub use channel::{Channel, ChannelStore, NewChannel};
pub use user::{AccountStore, ApiToken, NewToken, NewUser, User};

use serde::{Deserialize, Serialize};

/// Enabled/disabled flag shared by users, tokens and channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Enabled,
    Disabled,
}

impl Status {
    pub fn as_i64(&self) -> i64 {
        match self {
            Self::Enabled => 1,
            Self::Disabled => 2,
        }
    }

    pub fn from_i64(value: i64) -> Self {
        if value == 1 {
            Self::Enabled
        } else {
            Self::Disabled
        }
    }

    pub fn is_enabled(&self) -> bool {
        *self == Self::Enabled
    }
}
