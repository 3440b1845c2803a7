// Copyright (c) 2025 Mullvad VPN AB. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Traffic-analysis-defense building blocks for a WireGuard-style data plane.
//!
//! This crate provides two cooperating subsystems:
//!
//! - [`daita`]: a per-peer event/action pipeline that feeds traffic events into a
//!   probabilistic state-machine engine and injects cover-traffic padding packets
//!   at the times the engine decides.
//! - [`multihop`]: a synthetic tunnel device ([`multihop::MultihopTun`]) that lets
//!   one device's UDP bind feed another device's tunnel input entirely in-process,
//!   by synthesizing IPv4/IPv6 + UDP headers around the raw datagrams.
//!
//! The [`peer`] module contains the thin glue that ties DAITA to a peer's outbound
//! packet staging, and [`packet`] holds the packet buffers and wire-format
//! definitions shared by both subsystems.

pub mod daita;
pub mod multihop;
pub mod packet;
pub mod peer;
pub mod tun;

mod task;
