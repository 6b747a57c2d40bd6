// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Composite keys rendered as `a::b` strings.

use crate::AccessError;

pub const SEPARATOR: &str = "::";

/// Splits `id` into exactly `N` non-empty parts.
pub fn split<'a, const N: usize>(
    id: &'a str,
    what: &'static str,
) -> Result<[&'a str; N], AccessError> {
    let invalid = || AccessError::InvalidEntity {
        entity: what,
        reason: format!(
            "id {id:?} must have {N} non-empty parts separated by {SEPARATOR:?}"
        ),
    };

    let parts: Vec<&str> = id.split(SEPARATOR).collect();
    if parts.iter().any(|p| p.is_empty()) {
        return Err(invalid());
    }
    parts.try_into().map_err(|_| invalid())
}

pub fn join(parts: &[&str]) -> String {
    parts.join(SEPARATOR)
}
