// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The subset of the proxy's filter expression language that the harness produces.

use regex::Regex;

#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("unsupported filter operator {0:?}")]
    UnknownOperator(String),
    #[error("filter operator {0} needs an argument")]
    MissingArgument(String),
    #[error("bad regex in filter: {0}")]
    Regex(#[from] regex::Error),
}

#[derive(Debug)]
enum Clause {
    /// `~u`: regex searched in the full request URL.
    Url(Regex),
    /// `~m`: HTTP method, case-insensitively.
    Method(String),
    /// `~hq`: regex searched in each `name: value` request header line.
    RequestHeader(Regex),
}

/// What a filter gets to look at.
pub struct FlowInfo<'a> {
    pub method: &'a str,
    pub url: &'a str,
    pub headers: &'a [String],
}

/// Parsed filter expression. All clauses must match; no clauses matches everything.
#[derive(Debug, Default)]
pub struct FlowFilter {
    clauses: Vec<Clause>,
}

impl FlowFilter {
    pub fn parse(expression: &str) -> Result<Self, FilterError> {
        let mut tokens = expression.split_whitespace();
        let mut clauses = vec![];
        while let Some(operator) = tokens.next() {
            let mut argument = || {
                tokens
                    .next()
                    .ok_or_else(|| FilterError::MissingArgument(operator.to_owned()))
            };
            let clause = match operator {
                "~u" => Clause::Url(Regex::new(argument()?)?),
                "~m" => Clause::Method(argument()?.to_owned()),
                "~hq" => Clause::RequestHeader(Regex::new(argument()?)?),
                _ => return Err(FilterError::UnknownOperator(operator.to_owned())),
            };
            clauses.push(clause);
        }
        Ok(Self { clauses })
    }

    pub fn matches(&self, flow: &FlowInfo<'_>) -> bool {
        self.clauses.iter().all(|clause| match clause {
            Clause::Url(regex) => regex.is_match(flow.url),
            Clause::Method(method) => method.eq_ignore_ascii_case(flow.method),
            Clause::RequestHeader(regex) => flow.headers.iter().any(|h| regex.is_match(h)),
        })
    }
}
