// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

pub mod correlation;
pub mod random;
pub mod sbatch;
pub mod shell;
pub mod slurm;
