// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-agent admission control for ruleset pushes
//!
//! Each host agent may have at most `buffer_length` unanswered pushes
//! outstanding.  A push beyond that is dropped and counted, never queued.

use secgroup_common::typed_uuid::HostUuid;
use std::collections::BTreeMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

pub struct SendRateTracker {
    buffer_length: usize,
    outstanding: Mutex<BTreeMap<HostUuid, usize>>,
    discarded: AtomicU64,
}

impl SendRateTracker {
    pub fn new(buffer_length: usize) -> SendRateTracker {
        SendRateTracker {
            buffer_length,
            outstanding: Mutex::new(BTreeMap::new()),
            discarded: AtomicU64::new(0),
        }
    }

    /// Reserves a slot for one push to `host_id`
    ///
    /// Returns `false` (and counts a discard) if the agent already has
    /// `buffer_length` pushes outstanding.  Every `true` must eventually be
    /// matched by [`SendRateTracker::release()`] or a reset.
    pub fn can_send(&self, host_id: HostUuid) -> bool {
        let mut outstanding = self.outstanding.lock().unwrap();
        let count = outstanding.entry(host_id).or_insert(0);
        if *count < self.buffer_length {
            *count += 1;
            true
        } else {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Frees the slot held by one push (answered, timed out, or never sent)
    pub fn release(&self, host_id: HostUuid) {
        let mut outstanding = self.outstanding.lock().unwrap();
        if let Some(count) = outstanding.get_mut(&host_id) {
            // Answers for pushes sent before a reset land here.
            *count = count.saturating_sub(1);
        }
    }

    /// Forgets everything outstanding for `host_id` (agent connected or
    /// disconnected)
    pub fn reset(&self, host_id: HostUuid) {
        self.outstanding.lock().unwrap().insert(host_id, 0);
    }

    pub fn outstanding(&self, host_id: HostUuid) -> usize {
        self.outstanding.lock().unwrap().get(&host_id).copied().unwrap_or(0)
    }

    /// Total pushes dropped by admission control since startup
    pub fn discard_count(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    pub fn buffer_length(&self) -> usize {
        self.buffer_length
    }
}
