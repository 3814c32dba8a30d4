// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
pub mod dispatcher;
pub mod meta;
pub mod protocol;
pub mod session;
pub mod transport;
