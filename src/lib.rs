// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

pub mod channel;
pub mod config;
pub mod connection;
pub mod errors;
pub mod event;
pub mod publisher;
pub mod registry;
pub mod subscriber;
