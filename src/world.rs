//! In-game settings accepted by the server's convenience setters.
use std::str::FromStr;

use strum::VariantNames;
use strum_macros::{AsRefStr, EnumString};

use crate::error::ServerError;

/// Value of the `difficulty` property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr, VariantNames)]
#[strum(serialize_all = "snake_case")]
pub enum Difficulty {
    Peaceful,
    Easy,
    Normal,
    Hard,
}

/// Argument of the `weather` console command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr, VariantNames)]
#[strum(serialize_all = "snake_case")]
pub enum Weather {
    Clear,
    Rain,
    Thunder,
}

/// Argument of the `time set` console command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr, VariantNames)]
#[strum(serialize_all = "snake_case")]
pub enum TimeOfDay {
    Day,
    Night,
    Noon,
    Midnight,
}

/// Parses `value` exactly, reporting the accepted set on failure.
pub(crate) fn parse_setting<T>(field: &'static str, value: &str) -> Result<T, ServerError>
where
    T: FromStr + VariantNames,
{
    value.parse().map_err(|_| ServerError::Validation {
        field,
        value: value.to_string(),
        accepted: T::VARIANTS,
    })
}
