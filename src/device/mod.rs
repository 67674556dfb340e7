// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! GPU execution of the fusion kernel, behind the same trait as the
//! software path.

pub mod context;
pub mod fusion;
pub mod texture;
