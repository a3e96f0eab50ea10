// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

/// IPv4 frame framing: one datagram, self-delimited by its total-length
/// header field.
pub mod frame;
/// The minimal HTTP/1.0 surface the tunnel speaks.
pub mod http;
