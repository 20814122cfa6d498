// SPDX-License-Identifier: Apache-2.0

//! Errors raised while resolving options.

/// Errors raised while parsing option strings or environment variables.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// The option name is not recognized.
    #[error("unknown option `{0}`")]
    UnknownOption(String),

    /// The option value does not parse.
    #[error("invalid value `{value}` for option `{option}` (expected {expected})")]
    InvalidValue {
        /// Option name.
        option: &'static str,
        /// Offending value.
        value: String,
        /// Human-readable description of accepted values.
        expected: &'static str,
    },

    /// A token in the option string is not of the form `--key[=value]`.
    #[error("malformed option token `{0}` (expected `--key[=value]`)")]
    MalformedToken(String),
}
