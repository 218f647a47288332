// SPDX-License-Identifier: MPL-2.0

#![allow(unused)]

pub(crate) use alloc::{
    boxed::Box,
    collections::BTreeMap,
    sync::Arc,
    vec,
    vec::Vec,
};

pub(crate) use core::fmt::{self, Debug};

pub(crate) use log::{debug, error, info, trace, warn};

pub(crate) use crate::{
    error::{Errno, Error},
    return_errno, return_errno_with_msg,
};

pub(crate) type Result<T> = core::result::Result<T, Error>;
