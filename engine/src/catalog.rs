//! Celestial objects, constellation families and their learning groups.

use crate::astro::EquatorialPosition;
use crate::error::{FirmamentError, Result};
use firmament_shared::protocol::{CatalogWire, ConstellationWire, LobbyQuestion, StarWire};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashMap;

const BUILTIN_CATALOG: &str = include_str!("../data/catalog.json");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Star,
    Constellation,
}

/// Anything the viewer can point at.
#[derive(Debug, Clone, PartialEq)]
pub struct CelestialObject {
    pub id: String,
    pub kind: ObjectKind,
    pub position: EquatorialPosition,
    pub magnitude: Option<f64>,
    pub family: Option<String>,
}

impl CelestialObject {
    fn from_constellation(wire: &ConstellationWire) -> Self {
        Self {
            id: wire.name.clone(),
            kind: ObjectKind::Constellation,
            position: EquatorialPosition::new(wire.ra, wire.dec),
            magnitude: None,
            family: (!wire.family.is_empty()).then(|| wire.family.clone()),
        }
    }

    fn from_star(wire: &StarWire) -> Self {
        Self {
            id: wire
                .name
                .clone()
                .unwrap_or_else(|| format!("HIP {}", wire.hid)),
            kind: ObjectKind::Star,
            position: EquatorialPosition::new(wire.ra, wire.dec),
            magnitude: Some(wire.mag),
            family: None,
        }
    }
}

/// A family of constellations taught in groups, easiest group first.
#[derive(Debug, Clone, PartialEq)]
pub struct Family {
    pub name: String,
    pub info: String,
    /// Number of constellations the family counts toward progress
    pub total: u32,
    groups: Vec<Vec<String>>,
}

impl Family {
    pub fn groups(&self) -> &[Vec<String>] {
        &self.groups
    }

    pub fn group(&self, index: usize) -> Result<&[String]> {
        self.groups
            .get(index)
            .map(Vec::as_slice)
            .ok_or_else(|| FirmamentError::UnknownGroup {
                family: self.name.clone(),
                index,
            })
    }

    /// Constellations in groups `0..=index`, i.e. the progress a passed test records.
    pub fn constellations_through(&self, index: usize) -> Result<u32> {
        self.group(index)?;
        let count: usize = self.groups[..=index].iter().map(Vec::len).sum();
        Ok(count as u32)
    }
}

pub struct Catalog {
    constellations: Vec<CelestialObject>,
    stars: Vec<CelestialObject>,
    families: Vec<Family>,
    /// lowercase name -> index into `constellations`
    by_name: HashMap<String, usize>,
    by_hid: HashMap<u64, usize>,
}

impl Catalog {
    pub fn from_wire(wire: CatalogWire) -> Result<Self> {
        let mut constellations = Vec::with_capacity(wire.constellations.len());
        let mut by_name = HashMap::new();
        for c in &wire.constellations {
            if !c.ra.is_finite() || !c.dec.is_finite() {
                return Err(FirmamentError::InvalidCatalog(format!(
                    "constellation {} has no finite position",
                    c.name
                )));
            }
            if by_name
                .insert(c.name.to_lowercase(), constellations.len())
                .is_some()
            {
                return Err(FirmamentError::InvalidCatalog(format!(
                    "duplicate constellation {}",
                    c.name
                )));
            }
            constellations.push(CelestialObject::from_constellation(c));
        }

        let mut stars = Vec::with_capacity(wire.stars.len());
        let mut by_hid = HashMap::new();
        for s in &wire.stars {
            by_hid.insert(s.hid, stars.len());
            stars.push(CelestialObject::from_star(s));
        }

        let mut families = Vec::with_capacity(wire.families.len());
        for f in wire.families {
            let mut groups = f.groups;
            groups.sort_by_key(|g| g.level);
            for name in groups.iter().flat_map(|g| &g.constellations) {
                if !by_name.contains_key(&name.to_lowercase()) {
                    return Err(FirmamentError::InvalidCatalog(format!(
                        "family {} lists unknown constellation {}",
                        f.name, name
                    )));
                }
            }
            families.push(Family {
                name: f.name,
                info: f.info,
                total: f.num_constellations,
                groups: groups.into_iter().map(|g| g.constellations).collect(),
            });
        }

        Ok(Self {
            constellations,
            stars,
            families,
            by_name,
            by_hid,
        })
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let wire: CatalogWire = serde_json::from_str(json)
            .map_err(|e| FirmamentError::InvalidCatalog(e.to_string()))?;
        Self::from_wire(wire)
    }

    /// Catalog bundled with the engine.
    pub fn builtin() -> Result<Self> {
        Self::from_json(BUILTIN_CATALOG)
    }

    /// Case-insensitive lookup.
    pub fn constellation(&self, name: &str) -> Option<&CelestialObject> {
        self.by_name
            .get(&name.to_lowercase())
            .map(|&i| &self.constellations[i])
    }

    pub fn constellations(&self) -> &[CelestialObject] {
        &self.constellations
    }

    pub fn star(&self, hid: u64) -> Option<&CelestialObject> {
        self.by_hid.get(&hid).map(|&i| &self.stars[i])
    }

    pub fn stars(&self) -> &[CelestialObject] {
        &self.stars
    }

    /// Constellations and stars together, for "what am I looking at".
    pub fn objects(&self) -> impl Iterator<Item = &CelestialObject> {
        self.constellations.iter().chain(self.stars.iter())
    }

    pub fn families(&self) -> &[Family] {
        &self.families
    }

    /// Case-insensitive lookup.
    pub fn family(&self, name: &str) -> Result<&Family> {
        self.families
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| FirmamentError::UnknownFamily(name.to_string()))
    }

    /// A random constellation of the family: random group, then random member.
    pub fn random_family_member(&self, family: &str, rng: &mut impl Rng) -> Result<&CelestialObject> {
        let family = self.family(family)?;
        family
            .groups
            .choose(rng)
            .and_then(|g| g.choose(rng))
            .and_then(|name| self.constellation(name))
            .ok_or_else(|| FirmamentError::InvalidCatalog(format!("family {} is empty", family.name)))
    }

    /// Lobby question for a constellation, as the service hands it out.
    pub fn lobby_question(&self, name: &str) -> Option<LobbyQuestion> {
        self.constellation(name).map(|c| LobbyQuestion {
            name: c.id.clone(),
            ra: c.position.right_ascension,
            dec: c.position.declination,
        })
    }
}
