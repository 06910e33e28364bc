// Copyright 2026 the peerlink authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Wire format and transport plumbing.
//!
//! - `Frame`: one self-delimited packet and its codec
//! - `FrameParser`: incremental byte-stream to frame recovery with resync
//! - `Connection`: a peer socket with connect/idle/disconnect state
//! - `Listener`: the accept loop with its inbound connection cap

mod connection;
mod frame;
mod listener;
mod parser;

pub use connection::{Connection, ConnectionId, ConnectionKind};
pub use frame::{Frame, MessageStatus};
pub use listener::Listener;
pub use parser::{FrameParser, ParsedFrame};
