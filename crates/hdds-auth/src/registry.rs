// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Handle-keyed security object registry.
//!
//! All plugin objects live in one table keyed by an opaque 64-bit handle.
//! Handles come from a monotonically increasing counter (nil = 0), so a
//! handle is never reused within a process and a stale handle can only
//! miss, never alias. Objects are a tagged sum: typed lookups distinguish
//! "no such handle" from "handle of the wrong kind".

use std::collections::HashMap;

use crate::error::{AuthErrorKind, SecResult, SecurityException};
use crate::handshake::HandshakeInfo;
use crate::identity::{LocalIdentityInfo, RemoteIdentityInfo};

/// Kind tag of a registry object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    LocalIdentity,
    RemoteIdentity,
    Handshake,
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LocalIdentity => f.write_str("local identity"),
            Self::RemoteIdentity => f.write_str("remote identity"),
            Self::Handshake => f.write_str("handshake"),
        }
    }
}

/// A registry entry.
#[derive(Debug)]
pub(crate) enum SecurityObject {
    LocalIdentity(LocalIdentityInfo),
    RemoteIdentity(RemoteIdentityInfo),
    Handshake(HandshakeInfo),
}

impl SecurityObject {
    fn kind(&self) -> ObjectKind {
        match self {
            Self::LocalIdentity(_) => ObjectKind::LocalIdentity,
            Self::RemoteIdentity(_) => ObjectKind::RemoteIdentity,
            Self::Handshake(_) => ObjectKind::Handshake,
        }
    }
}

/// Handle-keyed object store.
#[derive(Debug)]
pub(crate) struct Registry {
    objects: HashMap<u64, SecurityObject>,
    next_handle: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            objects: HashMap::new(),
            next_handle: 1,
        }
    }

    /// Allocate a fresh handle (never nil, never reused).
    pub fn allocate_handle(&mut self) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    pub fn insert(&mut self, handle: u64, object: SecurityObject) {
        self.objects.insert(handle, object);
    }

    pub fn remove(&mut self, handle: u64) -> Option<SecurityObject> {
        self.objects.remove(&handle)
    }

    pub fn contains(&self, handle: u64) -> bool {
        self.objects.contains_key(&handle)
    }

    /// Kind of the object behind a handle, if any.
    pub fn kind_of(&self, handle: u64) -> Option<ObjectKind> {
        self.objects.get(&handle).map(SecurityObject::kind)
    }

    fn lookup(
        &self,
        context: &'static str,
        handle: u64,
        expected: ObjectKind,
    ) -> SecResult<&SecurityObject> {
        let object = self.objects.get(&handle).ok_or_else(|| {
            SecurityException::new(
                context,
                AuthErrorKind::InvalidHandle,
                format!("invalid handle {}", handle),
            )
        })?;
        if object.kind() != expected {
            return Err(SecurityException::new(
                context,
                AuthErrorKind::WrongHandleKind,
                format!(
                    "handle {} is a {}, expected a {}",
                    handle,
                    object.kind(),
                    expected
                ),
            ));
        }
        Ok(object)
    }

    fn lookup_mut(
        &mut self,
        context: &'static str,
        handle: u64,
        expected: ObjectKind,
    ) -> SecResult<&mut SecurityObject> {
        // presence and kind checked up front so the error paths cannot
        // hold a mutable borrow
        self.lookup(context, handle, expected)?;
        Ok(self
            .objects
            .get_mut(&handle)
            .expect("lookup above guarantees presence"))
    }

    pub fn local(
        &self,
        context: &'static str,
        handle: u64,
    ) -> SecResult<&LocalIdentityInfo> {
        match self.lookup(context, handle, ObjectKind::LocalIdentity)? {
            SecurityObject::LocalIdentity(info) => Ok(info),
            _ => unreachable!("lookup checked the kind"),
        }
    }

    pub fn local_mut(
        &mut self,
        context: &'static str,
        handle: u64,
    ) -> SecResult<&mut LocalIdentityInfo> {
        match self.lookup_mut(context, handle, ObjectKind::LocalIdentity)? {
            SecurityObject::LocalIdentity(info) => Ok(info),
            _ => unreachable!("lookup checked the kind"),
        }
    }

    pub fn remote(
        &self,
        context: &'static str,
        handle: u64,
    ) -> SecResult<&RemoteIdentityInfo> {
        match self.lookup(context, handle, ObjectKind::RemoteIdentity)? {
            SecurityObject::RemoteIdentity(info) => Ok(info),
            _ => unreachable!("lookup checked the kind"),
        }
    }

    pub fn remote_mut(
        &mut self,
        context: &'static str,
        handle: u64,
    ) -> SecResult<&mut RemoteIdentityInfo> {
        match self.lookup_mut(context, handle, ObjectKind::RemoteIdentity)? {
            SecurityObject::RemoteIdentity(info) => Ok(info),
            _ => unreachable!("lookup checked the kind"),
        }
    }

    pub fn handshake(
        &self,
        context: &'static str,
        handle: u64,
    ) -> SecResult<&HandshakeInfo> {
        match self.lookup(context, handle, ObjectKind::Handshake)? {
            SecurityObject::Handshake(info) => Ok(info),
            _ => unreachable!("lookup checked the kind"),
        }
    }

    pub fn handshake_mut(
        &mut self,
        context: &'static str,
        handle: u64,
    ) -> SecResult<&mut HandshakeInfo> {
        match self.lookup_mut(context, handle, ObjectKind::Handshake)? {
            SecurityObject::Handshake(info) => Ok(info),
            _ => unreachable!("lookup checked the kind"),
        }
    }

    /// Find the handshake linking a (local, remote) identity pair.
    pub fn find_handshake(&self, local_handle: u64, remote_handle: u64) -> Option<u64> {
        self.objects.iter().find_map(|(handle, object)| match object {
            SecurityObject::Handshake(hs)
                if hs.local_handle == local_handle && hs.remote_handle == remote_handle =>
            {
                Some(*handle)
            }
            _ => None,
        })
    }

    /// Handles of every object of a kind (used by teardown sweeps).
    pub fn handles_of_kind(&self, kind: ObjectKind) -> Vec<u64> {
        self.objects
            .iter()
            .filter(|(_, object)| object.kind() == kind)
            .map(|(handle, _)| *handle)
            .collect()
    }
}
