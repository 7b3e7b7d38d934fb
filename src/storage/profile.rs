// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Local profile stored as JSON.

use anyhow::Result;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};

use super::models::Profile;
use super::ProfileStore;

/// Profile kept in `profile.json` under the data directory.
pub struct FileProfileStore {
    path: PathBuf,
    profile: RwLock<Profile>,
}

impl FileProfileStore {
    /// Open the profile file, writing `default` when none exists yet.
    pub fn new(data_dir: &Path, default: Profile) -> Result<Self> {
        let path = data_dir.join("profile.json");
        let profile = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content)?
        } else {
            default
        };

        let store = Self {
            path,
            profile: RwLock::new(profile),
        };
        store.save()?;
        Ok(store)
    }

    /// Replace the profile and persist it.
    pub fn set_profile(&self, profile: Profile) -> Result<()> {
        *self.profile.write() = profile;
        self.save()
    }

    /// Save to disk.
    fn save(&self) -> Result<()> {
        let content = serde_json::to_string_pretty(&*self.profile.read())?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }
}

impl ProfileStore for FileProfileStore {
    fn get_profile(&self) -> Result<Profile> {
        Ok(self.profile.read().clone())
    }
}
