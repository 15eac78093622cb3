//! Unit Spec Catalog
//!
//! Immutable base statistics for every troop and tower kind. Loaded from
//! `troops.json` / `towers.json` in the data directory; missing files are
//! seeded with the built-in defaults so a fresh server starts without any
//! setup. A file that exists but cannot be parsed is a startup error.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::game::types::{TowerKind, TroopKind};

/// Base statistics for a troop kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TroopSpec {
    /// Base hit points (0 for the Queen, who never enters combat).
    pub hp: u32,
    /// Base attack.
    pub atk: u32,
    /// Base defense.
    pub def: u32,
    /// Critical-hit chance in `[0, 1]`.
    pub crit: f64,
    /// Mana cost to summon (Enhanced mode).
    pub mana: u32,
    /// EXP awarded for destroying this troop.
    pub exp: u32,
    /// Special-ability description, if any.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub special: Option<String>,
}

/// Base statistics for a tower kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TowerSpec {
    /// Base hit points.
    pub hp: u32,
    /// Base attack (used for counter-attacks).
    pub atk: u32,
    /// Base defense.
    pub def: u32,
    /// Critical-hit chance in `[0, 1]`.
    pub crit: f64,
    /// EXP awarded for destroying this tower.
    pub exp: u32,
}

/// Catalog load errors.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// A spec file could not be read or written.
    #[error("spec file I/O: {0}")]
    Io(#[from] std::io::Error),

    /// A spec file exists but is not valid JSON of the expected shape.
    #[error("spec file parse: {0}")]
    Parse(#[from] serde_json::Error),

    /// A kind has no entry in the loaded tables.
    #[error("spec catalog is missing an entry for {0}")]
    Incomplete(String),
}

#[derive(Serialize, Deserialize)]
struct TroopFile {
    troops: BTreeMap<TroopKind, TroopSpec>,
}

#[derive(Serialize, Deserialize)]
struct TowerFile {
    towers: BTreeMap<TowerKind, TowerSpec>,
}

/// Read-only snapshot of the unit stat tables.
///
/// Completeness (an entry for every kind) is validated at construction,
/// so the accessors index unconditionally.
#[derive(Debug, Clone)]
pub struct SpecCatalog {
    troops: BTreeMap<TroopKind, TroopSpec>,
    towers: BTreeMap<TowerKind, TowerSpec>,
}

impl SpecCatalog {
    /// The built-in default stat tables.
    pub fn builtin() -> Self {
        let troop = |hp, atk, def, crit, mana, exp| TroopSpec {
            hp,
            atk,
            def,
            crit,
            mana,
            exp,
            special: None,
        };

        let mut troops = BTreeMap::new();
        troops.insert(TroopKind::Pawn, troop(50, 150, 100, 0.05, 3, 5));
        troops.insert(TroopKind::Bishop, troop(100, 200, 150, 0.10, 4, 10));
        troops.insert(TroopKind::Rook, troop(250, 200, 200, 0.15, 5, 25));
        troops.insert(TroopKind::Knight, troop(200, 300, 150, 0.20, 5, 25));
        troops.insert(TroopKind::Prince, troop(500, 400, 300, 0.25, 6, 50));
        troops.insert(
            TroopKind::Queen,
            TroopSpec {
                hp: 0,
                atk: 0,
                def: 0,
                crit: 0.30,
                mana: 5,
                exp: 30,
                special: Some("Heals the friendly tower with lowest HP by 300".into()),
            },
        );

        let mut towers = BTreeMap::new();
        towers.insert(
            TowerKind::KingTower,
            TowerSpec {
                hp: 2000,
                atk: 500,
                def: 300,
                crit: 0.10,
                exp: 200,
            },
        );
        for guard in [TowerKind::GuardTower1, TowerKind::GuardTower2] {
            towers.insert(
                guard,
                TowerSpec {
                    hp: 1000,
                    atk: 300,
                    def: 100,
                    crit: 0.05,
                    exp: 100,
                },
            );
        }

        SpecCatalog { troops, towers }
    }

    /// Load the catalog from `troops.json` / `towers.json` under `data_dir`,
    /// seeding missing files with the built-in defaults first.
    pub fn load(data_dir: &Path) -> Result<Self, CatalogError> {
        fs::create_dir_all(data_dir)?;
        let defaults = Self::builtin();

        let troops_path = data_dir.join("troops.json");
        let troops = if troops_path.exists() {
            let raw = fs::read_to_string(&troops_path)?;
            let file: TroopFile = serde_json::from_str(&raw)?;
            file.troops
        } else {
            info!("seeding default troop specs at {}", troops_path.display());
            let file = TroopFile {
                troops: defaults.troops.clone(),
            };
            fs::write(&troops_path, serde_json::to_string_pretty(&file)?)?;
            file.troops
        };

        let towers_path = data_dir.join("towers.json");
        let towers = if towers_path.exists() {
            let raw = fs::read_to_string(&towers_path)?;
            let file: TowerFile = serde_json::from_str(&raw)?;
            file.towers
        } else {
            info!("seeding default tower specs at {}", towers_path.display());
            let file = TowerFile {
                towers: defaults.towers.clone(),
            };
            fs::write(&towers_path, serde_json::to_string_pretty(&file)?)?;
            file.towers
        };

        let catalog = SpecCatalog { troops, towers };
        catalog.validate()?;
        Ok(catalog)
    }

    fn validate(&self) -> Result<(), CatalogError> {
        for kind in TroopKind::ALL {
            if !self.troops.contains_key(&kind) {
                return Err(CatalogError::Incomplete(kind.to_string()));
            }
        }
        for kind in TowerKind::ALL {
            if !self.towers.contains_key(&kind) {
                return Err(CatalogError::Incomplete(kind.to_string()));
            }
        }
        Ok(())
    }

    /// Base stats for a troop kind.
    pub fn troop_spec(&self, kind: TroopKind) -> &TroopSpec {
        &self.troops[&kind]
    }

    /// Base stats for a tower kind.
    pub fn tower_spec(&self, kind: TowerKind) -> &TowerSpec {
        &self.towers[&kind]
    }
}
