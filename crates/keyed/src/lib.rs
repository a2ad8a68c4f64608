// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Strand

pub use distributor::KeyDistributor;
pub use facade::KeyScheduler;
pub use strand_core::{Error, Result};

mod distributor;
mod facade;
