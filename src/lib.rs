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

//! Peer-to-peer messaging runtime.
//!
//! Every node binds a local endpoint, accepts connections from peers, dials
//! peers of its own, and exchanges framed, typed messages with automatic
//! delivery receipts. See [`node::Node`] for the runtime surface and
//! [`network::Frame`] for the wire format.

pub mod network;
pub mod node;
pub mod service;
pub mod transport;

pub use network::{Connection, ConnectionId, ConnectionKind, Frame, FrameParser, Listener,
    MessageStatus, ParsedFrame};
pub use node::{Json, Message, Node, Payload};
pub use service::{setup_local_tracing, AppError, AppResult, NodeConfig};
pub use transport::TransportKind;
