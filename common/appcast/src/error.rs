// Copyright 2025 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("the release feed is not valid xml (around byte {position}): {source}")]
    MalformedXml {
        position: usize,
        #[source]
        source: quick_xml::Error,
    },

    #[error("the release feed is not valid utf-8")]
    InvalidEncoding,
}
