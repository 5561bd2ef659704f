//  Copyright 2020 Two Sigma Investments, LP.
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

use std::sync::{mpsc, Mutex};

/// A fan-out notification channel for one bitmap's 0->1 bit transitions.
///
/// `vmnetfs` gives each image a single `io_stream` group shared by the present,
/// modified and accessed bitmaps. The external interface here requires three
/// independent stream groups, so each `Bitmap` owns one of these rather than
/// sharing a single group at the `Image` level.
#[derive(Default)]
pub struct StreamGroup {
    subscribers: Mutex<Vec<mpsc::Sender<u64>>>,
}

impl StreamGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribers that join after an event was published never see it: there is no
    /// history buffer, matching the "late subscribers miss history" contract.
    pub fn subscribe(&self) -> mpsc::Receiver<u64> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    pub fn publish(&self, chunk: u64) {
        let mut subs = self.subscribers.lock().unwrap();
        subs.retain(|tx| tx.send(chunk).is_ok());
    }

    /// Closes the group: subsequent `subscribe()` calls still work, but all current
    /// subscribers observe their receiver disconnect.
    pub fn close(&self) {
        self.subscribers.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscriber_receives_published_events() {
        let g = StreamGroup::new();
        let rx = g.subscribe();
        g.publish(7);
        assert_eq!(rx.recv().unwrap(), 7);
    }

    #[test]
    fn late_subscriber_misses_history() {
        let g = StreamGroup::new();
        g.publish(1);
        let rx = g.subscribe();
        g.publish(2);
        assert_eq!(rx.recv().unwrap(), 2);
    }

    #[test]
    fn dead_subscribers_are_pruned() {
        let g = StreamGroup::new();
        {
            let _rx = g.subscribe();
        }
        g.publish(1);
        assert_eq!(g.subscribers.lock().unwrap().len(), 0);
    }
}
