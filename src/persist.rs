/*
 *
 *    Copyright (c) 2020-2022 Project CHIP Authors
 *
 *    Licensed under the Apache License, Version 2.0 (the "License");
 *    you may not use this file except in compliance with the License.
 *    You may obtain a copy of the License at
 *
 *        http://www.apache.org/licenses/LICENSE-2.0
 *
 *    Unless required by applicable law or agreed to in writing, software
 *    distributed under the License is distributed on an "AS IS" BASIS,
 *    WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *    See the License for the specific language governing permissions and
 *    limitations under the License.
 */

//! Key/value persistence for state that must survive a restart.

use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use log::{debug, info};

use crate::error::*;

pub trait PersistentStorage {
    /// Reads the value stored under `key` into `buf`. Returns `None` when the
    /// key was never stored.
    fn load<'a>(&self, key: &str, buf: &'a mut [u8]) -> Result<Option<&'a [u8]>, Error>;

    fn store(&self, key: &str, data: &[u8]) -> Result<(), Error>;

    fn remove(&self, key: &str) -> Result<(), Error>;
}

/// One file per key under a directory.
pub struct FilePsm {
    dir: PathBuf,
}

impl FilePsm {
    pub fn new(dir: PathBuf) -> Result<Self, Error> {
        fs::create_dir_all(&dir)?;

        Ok(Self { dir })
    }
}

impl PersistentStorage for FilePsm {
    fn load<'a>(&self, key: &str, buf: &'a mut [u8]) -> Result<Option<&'a [u8]>, Error> {
        let path = self.dir.join(key);

        let mut file = match fs::File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => Err(e)?,
        };

        let mut offset = 0;
        loop {
            if offset == buf.len() {
                Err(ErrorCode::NoSpace)?;
            }

            let len = file.read(&mut buf[offset..])?;
            if len == 0 {
                break;
            }

            offset += len;
        }

        let data = &buf[..offset];
        debug!("Key {}: loaded {} bytes", key, data.len());

        Ok(Some(data))
    }

    fn store(&self, key: &str, data: &[u8]) -> Result<(), Error> {
        let path = self.dir.join(key);

        let mut file = fs::File::create(path)?;
        file.write_all(data)?;
        file.sync_all()?;

        debug!("Key {}: stored {} bytes", key, data.len());

        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), Error> {
        match fs::remove_file(self.dir.join(key)) {
            Ok(()) => {
                info!("Key {}: removed", key);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory storage, shared between threads behind a mutex.
#[derive(Default)]
pub struct MemPsm {
    map: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemPsm {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistentStorage for MemPsm {
    fn load<'a>(&self, key: &str, buf: &'a mut [u8]) -> Result<Option<&'a [u8]>, Error> {
        let map = self.map.lock()?;

        let Some(data) = map.get(key) else {
            return Ok(None);
        };

        if data.len() > buf.len() {
            Err(ErrorCode::NoSpace)?;
        }

        buf[..data.len()].copy_from_slice(data);
        Ok(Some(&buf[..data.len()]))
    }

    fn store(&self, key: &str, data: &[u8]) -> Result<(), Error> {
        self.map.lock()?.insert(key.to_owned(), data.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), Error> {
        self.map.lock()?.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(psm: &dyn PersistentStorage) {
        let mut buf = [0; 8];
        assert_eq!(psm.load("GlobalMCTR", &mut buf).unwrap(), None);

        psm.store("GlobalMCTR", &[1, 2, 3, 4]).unwrap();
        assert_eq!(
            psm.load("GlobalMCTR", &mut buf).unwrap(),
            Some(&[1, 2, 3, 4][..])
        );

        let mut small = [0; 2];
        assert!(psm.load("GlobalMCTR", &mut small).is_err());

        psm.remove("GlobalMCTR").unwrap();
        assert_eq!(psm.load("GlobalMCTR", &mut buf).unwrap(), None);
        psm.remove("GlobalMCTR").unwrap();
    }

    #[test]
    fn test_mem_psm() {
        exercise(&MemPsm::new());
    }

    #[test]
    fn test_file_psm() {
        let dir = std::env::temp_dir().join(format!("matter-transport-psm-{}", std::process::id()));
        let psm = FilePsm::new(dir.clone()).unwrap();
        exercise(&psm);
        let _ = fs::remove_dir_all(dir);
    }
}
