use crate::common::*;

const LEDGER_FILE: &str = "checkpoints.json";

/// Which checkpoint to restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointSelector {
    /// A checkpoint by its name, without the file extension.
    Name(String),
    Epoch(usize),
    /// The checkpoint with the highest validation score.
    Best,
    /// The most recently saved checkpoint.
    Latest,
}

impl Default for CheckpointSelector {
    fn default() -> Self {
        Self::Best
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub name: String,
    pub epoch: usize,
    /// Optimizer steps taken when the checkpoint was written.
    pub step: usize,
    /// Validation PSNR, if the epoch was validated.
    pub score: Option<f64>,
}

/// The outcome of a restore request.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointLoad {
    /// The resolved checkpoint, if the selector matched one.
    pub name: Option<String>,
    pub entry: Option<CheckpointEntry>,
    pub loaded: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Ledger {
    entries: Vec<CheckpointEntry>,
}

/// Writes parameter snapshots and the ledger describing them.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
    prefix: String,
    max_keep: usize,
}

impl CheckpointManager {
    pub fn new<P>(dir: P, prefix: impl Into<String>, max_keep: usize) -> Self
    where
        P: AsRef<Path>,
    {
        Self {
            dir: dir.as_ref().to_owned(),
            prefix: prefix.into(),
            max_keep: max_keep.max(1),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_of(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.pt", name))
    }

    /// Saved checkpoints, oldest first.
    pub fn entries(&self) -> Fallible<Vec<CheckpointEntry>> {
        Ok(self.read_ledger()?.entries)
    }

    /// Saves `vs` as the checkpoint of `epoch` and evicts the oldest
    /// checkpoints beyond the retention limit, never the best one.
    pub fn save(
        &self,
        vs: &VarStore,
        epoch: usize,
        step: usize,
        score: Option<f64>,
    ) -> Fallible<CheckpointEntry> {
        fs::create_dir_all(&self.dir)?;

        let name = format!("{}_{:05}", self.prefix, epoch);
        let path = self.path_of(&name);
        vs.save(&path)
            .with_context(|| format!("unable to write checkpoint {}", path.display()))?;

        let entry = CheckpointEntry {
            name: name.clone(),
            epoch,
            step,
            score,
        };
        let mut ledger = self.read_ledger()?;
        ledger.entries.retain(|prev| prev.name != name);
        ledger.entries.push(entry.clone());

        while ledger.entries.len() > self.max_keep {
            let best = best_entry(&ledger.entries).map(|best| best.name.clone());
            let position = match ledger
                .entries
                .iter()
                .position(|prev| Some(&prev.name) != best.as_ref() && prev.name != name)
            {
                Some(position) => position,
                None => break,
            };
            let evicted = ledger.entries.remove(position);
            let evicted_path = self.path_of(&evicted.name);
            if let Err(err) = fs::remove_file(&evicted_path) {
                warn!("unable to remove {}: {}", evicted_path.display(), err);
            }
            debug!("evicted checkpoint {}", evicted.name);
        }

        self.write_ledger(&ledger)?;
        info!("saved checkpoint {}", path.display());
        Ok(entry)
    }

    /// The ledger entry `selector` refers to.
    pub fn resolve(&self, selector: &CheckpointSelector) -> Fallible<Option<CheckpointEntry>> {
        let entries = self.entries()?;
        let entry = match selector {
            CheckpointSelector::Name(name) => entries.iter().find(|entry| &entry.name == name),
            CheckpointSelector::Epoch(epoch) => entries.iter().find(|entry| entry.epoch == *epoch),
            CheckpointSelector::Best => best_entry(&entries),
            CheckpointSelector::Latest => entries.iter().max_by_key(|entry| entry.epoch),
        };
        Ok(entry.cloned())
    }

    /// Restores the selected checkpoint into `vs`.
    ///
    /// A selector that matches nothing, or whose file is gone, is reported
    /// with `loaded == false`. A file that exists but does not fit `vs` is an
    /// error.
    pub fn load(&self, vs: &mut VarStore, selector: &CheckpointSelector) -> Fallible<CheckpointLoad> {
        let entry = match self.resolve(selector)? {
            Some(entry) => entry,
            None => {
                warn!("no checkpoint matches {:?} in {}", selector, self.dir.display());
                return Ok(CheckpointLoad {
                    name: None,
                    entry: None,
                    loaded: false,
                });
            }
        };

        let path = self.path_of(&entry.name);
        if !path.is_file() {
            warn!("checkpoint file {} is missing", path.display());
            return Ok(CheckpointLoad {
                name: Some(entry.name.clone()),
                entry: Some(entry),
                loaded: false,
            });
        }

        vs.load(&path)
            .with_context(|| format!("unable to restore checkpoint {}", path.display()))?;
        info!("restored checkpoint {}", path.display());

        Ok(CheckpointLoad {
            name: Some(entry.name.clone()),
            entry: Some(entry),
            loaded: true,
        })
    }

    fn read_ledger(&self) -> Fallible<Ledger> {
        let path = self.dir.join(LEDGER_FILE);
        if !path.is_file() {
            return Ok(Ledger::default());
        }
        let text = fs::read_to_string(&path)?;
        let ledger = serde_json::from_str(&text)
            .with_context(|| format!("corrupted checkpoint ledger {}", path.display()))?;
        Ok(ledger)
    }

    fn write_ledger(&self, ledger: &Ledger) -> Fallible<()> {
        let path = self.dir.join(LEDGER_FILE);
        let tmp_path = self.dir.join(format!("{}.tmp", LEDGER_FILE));
        fs::write(&tmp_path, serde_json::to_string_pretty(ledger)?)?;
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }
}

/// The highest-scoring entry, the later one on ties.
fn best_entry(entries: &[CheckpointEntry]) -> Option<&CheckpointEntry> {
    entries
        .iter()
        .filter_map(|entry| entry.score.map(|score| (score, entry)))
        .fold(None, |best: Option<(f64, &CheckpointEntry)>, (score, entry)| match best {
            Some((best_score, _)) if best_score > score => best,
            _ => Some((score, entry)),
        })
        .map(|(_, entry)| entry)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(fill: f64) -> VarStore {
        let vs = VarStore::new(Device::Cpu);
        let _ = vs.root().ones("w", &[2]);
        tch::no_grad(|| {
            for (_, mut var) in vs.variables() {
                var.fill_(fill);
            }
        });
        vs
    }

    fn value(vs: &VarStore) -> f64 {
        vs.variables()["w"].double_value(&[0])
    }

    #[test]
    fn selector_deserializes_from_config_text() {
        let best: CheckpointSelector = json5::from_str(r#""best""#).unwrap();
        assert_eq!(best, CheckpointSelector::Best);
        let epoch: CheckpointSelector = json5::from_str("{ epoch: 7 }").unwrap();
        assert_eq!(epoch, CheckpointSelector::Epoch(7));
        let name: CheckpointSelector = json5::from_str(r#"{ name: "pvd_00003" }"#).unwrap();
        assert_eq!(name, CheckpointSelector::Name("pvd_00003".into()));
    }

    #[test]
    fn saves_and_resolves_by_every_selector() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), "pvd", 10);

        manager.save(&store(1.0), 1, 10, Some(25.0)).unwrap();
        manager.save(&store(2.0), 2, 20, Some(27.5)).unwrap();
        manager.save(&store(3.0), 3, 30, Some(26.0)).unwrap();

        let resolve = |selector| manager.resolve(&selector).unwrap().unwrap().name;
        assert_eq!(resolve(CheckpointSelector::Best), "pvd_00002");
        assert_eq!(resolve(CheckpointSelector::Latest), "pvd_00003");
        assert_eq!(resolve(CheckpointSelector::Epoch(1)), "pvd_00001");
        assert_eq!(resolve(CheckpointSelector::Name("pvd_00003".into())), "pvd_00003");

        let mut vs = store(0.0);
        let report = manager.load(&mut vs, &CheckpointSelector::Best).unwrap();
        assert!(report.loaded);
        assert_eq!(report.name.as_deref(), Some("pvd_00002"));
        assert_eq!(report.entry.map(|entry| entry.step), Some(20));
        assert_eq!(value(&vs), 2.0);
    }

    #[test]
    fn reports_unmatched_selectors() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), "pvd", 10);

        let mut vs = store(0.0);
        let report = manager.load(&mut vs, &CheckpointSelector::Latest).unwrap();
        assert!(!report.loaded);
        assert!(report.name.is_none());

        manager.save(&store(1.0), 1, 1, None).unwrap();
        let report = manager.load(&mut vs, &CheckpointSelector::Epoch(9)).unwrap();
        assert!(!report.loaded);
        assert!(manager.resolve(&CheckpointSelector::Best).unwrap().is_none());
    }

    #[test]
    fn evicts_oldest_but_keeps_best() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), "pvd", 2);

        manager.save(&store(1.0), 1, 1, Some(30.0)).unwrap();
        manager.save(&store(2.0), 2, 2, Some(20.0)).unwrap();
        manager.save(&store(3.0), 3, 3, Some(21.0)).unwrap();

        let names = manager
            .entries()
            .unwrap()
            .into_iter()
            .map(|entry| entry.name)
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["pvd_00001", "pvd_00003"]);
        assert!(!manager.path_of("pvd_00002").exists());
        assert!(manager.path_of("pvd_00001").exists());
    }
}
