/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::collections::BTreeMap;
use std::sync::mpsc::Sender;

use log::debug;
use parking_lot::Mutex;

use super::{StateDriver, StateItem, WatchEvent};
use crate::error::{Error, Result};

// In-process state driver. Backs tests and single-host deployments; the
// etcd driver serves clustered ones through the same trait.
#[derive(Default)]
pub struct MemStateDriver {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<String, Vec<u8>>,
    watchers: Vec<(String, Sender<WatchEvent>)>,
}

impl MemStateDriver {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn key_count(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().entries.keys().cloned().collect()
    }

    pub fn dump_state(&self) {
        for (key, value) in self.inner.lock().entries.iter() {
            debug!("state: {} -> {}", key, String::from_utf8_lossy(value));
        }
    }
}

impl Inner {
    fn notify(&mut self, key: &str, event: WatchEvent) {
        // senders whose receiver is gone are dropped on the spot
        self.watchers
            .retain(|(prefix, tx)| !key.starts_with(prefix.as_str()) || tx.send(event.clone()).is_ok());
    }
}

impl StateDriver for MemStateDriver {
    fn read(&self, key: &str) -> Result<Vec<u8>> {
        self.inner
            .lock()
            .entries
            .get(key)
            .cloned()
            .ok_or_else(|| Error::StateKeyNotFound(key.to_owned()))
    }

    fn read_all(&self, prefix: &str) -> Result<Vec<StateItem>> {
        Ok(self
            .inner
            .lock()
            .entries
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| StateItem {
                key: k.clone(),
                value: v.clone(),
            })
            .collect())
    }

    fn write(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        let prev = inner.entries.insert(key.to_owned(), value.to_vec());
        let event = WatchEvent {
            prev: prev.map(|value| StateItem {
                key: key.to_owned(),
                value,
            }),
            curr: Some(StateItem {
                key: key.to_owned(),
                value: value.to_vec(),
            }),
        };
        inner.notify(key, event);
        Ok(())
    }

    fn clear(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(value) = inner.entries.remove(key) {
            let event = WatchEvent {
                prev: Some(StateItem {
                    key: key.to_owned(),
                    value,
                }),
                curr: None,
            };
            inner.notify(key, event);
        }
        Ok(())
    }

    fn watch_all(&self, prefix: &str, tx: Sender<WatchEvent>) -> Result<()> {
        self.inner.lock().watchers.push((prefix.to_owned(), tx));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    #[test]
    fn read_write_clear() {
        let driver = MemStateDriver::new();
        assert!(matches!(
            driver.read("nets/none"),
            Err(Error::StateKeyNotFound(_))
        ));

        driver.write("nets/orange", b"{}").unwrap();
        driver.write("nets/purple", b"{}").unwrap();
        driver.write("eps/c1", b"{}").unwrap();
        assert_eq!(driver.read("nets/orange").unwrap(), b"{}");

        let nets = driver.read_all("nets/").unwrap();
        assert_eq!(nets.len(), 2);
        assert_eq!(nets[0].key, "nets/orange");

        driver.clear("nets/orange").unwrap();
        assert!(driver.read("nets/orange").is_err());
        assert_eq!(driver.read_all("nets/").unwrap().len(), 1);
    }

    #[test]
    fn watch_event_shapes() {
        let driver = MemStateDriver::new();
        let (tx, rx) = mpsc::channel();
        driver.watch_all("nets/", tx).unwrap();

        // outside the watched prefix, no event
        driver.write("eps/c1", b"{}").unwrap();

        driver.write("nets/orange", b"a").unwrap();
        let ev = rx.try_recv().unwrap();
        assert!(ev.prev.is_none());
        assert_eq!(ev.curr.unwrap().value, b"a");

        driver.write("nets/orange", b"b").unwrap();
        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.prev.unwrap().value, b"a");
        assert_eq!(ev.curr.unwrap().value, b"b");

        driver.clear("nets/orange").unwrap();
        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.prev.unwrap().value, b"b");
        assert!(ev.curr.is_none());

        assert!(rx.try_recv().is_err());
    }
}
