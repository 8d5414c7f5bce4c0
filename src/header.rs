/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
//! In-memory disc-header group model, and the parser/serializer for its
//! wire string form: `0;title//1-3;groupA//4;groupB//…`.

use log::debug;

use crate::error::{Error, Result};

/// A single entry in the disc-header model. Entry 0 is always the disc
/// title (`first == 0`, `last == None`); every other entry is a group of
/// one or more tracks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub id: u32,
    pub first: u32,
    pub last: Option<u32>,
    pub title: String,
}

/// The disc-header model: an ordered list of groups plus the disc title
/// entry, with invariants enforced on every mutation.
#[derive(Debug, Clone, Default)]
pub struct DiscHeader {
    groups: Vec<Group>,
    next_id: u32,
}

impl DiscHeader {
    pub fn new() -> Self {
        let mut h = DiscHeader { groups: Vec::new(), next_id: 1 };
        h.groups.push(Group { id: 0, first: 0, last: None, title: String::new() });
        h
    }

    pub fn disc_title(&self) -> &str {
        &self.groups[0].title
    }

    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.iter().filter(|g| g.id != 0)
    }

    /// Parses a wire header string. On any invariant violation the model
    /// is left empty (disc title only) and `HeaderInvalid` is returned.
    pub fn parse(s: &str) -> Result<Self> {
        if !s.contains("//") {
            let mut h = Self::new();
            h.groups[0].title = s.to_string();
            return Ok(h);
        }

        let mut candidate = DiscHeader { groups: Vec::new(), next_id: 1 };
        for entry in s.split("//") {
            if entry.is_empty() {
                continue;
            }
            let Some((range, title)) = entry.split_once(';') else {
                return Err(invalid(&mut candidate));
            };
            let Some((first, last)) = parse_range(range) else {
                return Err(invalid(&mut candidate));
            };

            if first == 0 {
                candidate.groups.insert(0, Group { id: 0, first: 0, last: None, title: title.to_string() });
            } else {
                let id = candidate.next_id;
                candidate.next_id += 1;
                candidate.groups.push(Group { id, first, last, title: title.to_string() });
            }
        }

        if candidate.groups.is_empty() || candidate.groups[0].id != 0 {
            // no disc-title entry (first=0) was present.
            return Err(Error::other("HeaderInvalid"));
        }

        candidate.sanity_check().map_err(|e| {
            debug!("header parse rejected by sanity check: {e}");
            e
        })?;

        Ok(candidate)
    }

    /// Serializes the model back to its wire string form.
    pub fn serialize(&self) -> String {
        if self.groups.len() == 1 {
            return self.groups[0].title.clone();
        }

        let mut out = format!("0;{}//", self.groups[0].title);
        let mut sorted: Vec<&Group> = self.groups.iter().filter(|g| g.id != 0).collect();
        sorted.sort_by_key(|g| g.first);
        for g in sorted {
            match g.last {
                Some(last) => out.push_str(&format!("{}-{};{}//", g.first, last, g.title)),
                None => out.push_str(&format!("{};{}//", g.first, g.title)),
            }
        }
        out
    }

    fn sanity_check(&self) -> Result<()> {
        let title = self.groups.iter().find(|g| g.id == 0).ok_or_else(|| Error::other("HeaderInvalid"))?;
        if title.last.is_some() {
            return Err(Error::other("HeaderInvalid"));
        }

        let mut rest: Vec<&Group> = self.groups.iter().filter(|g| g.id != 0).collect();
        rest.sort_by_key(|g| g.first);

        let mut prev_last: Option<u32> = None;
        for g in rest {
            if let Some(last) = g.last {
                if last < g.first {
                    return Err(Error::other("HeaderInvalid"));
                }
            }
            if let Some(p) = prev_last {
                if g.first <= p {
                    return Err(Error::other("HeaderInvalid"));
                }
            }
            prev_last = Some(g.last.unwrap_or(g.first));
        }
        Ok(())
    }

    fn try_mutate(&mut self, f: impl FnOnce(&mut DiscHeader)) -> Result<()> {
        let mut scratch = self.clone();
        f(&mut scratch);
        scratch.sanity_check()?;
        *self = scratch;
        Ok(())
    }

    pub fn set_disc_title(&mut self, title: &str) {
        self.groups[0].title = title.to_string();
    }

    pub fn add_group(&mut self, first: u32, last: Option<u32>, title: &str) -> Result<()> {
        self.try_mutate(|h| {
            let id = h.next_id;
            h.next_id += 1;
            h.groups.push(Group { id, first, last, title: title.to_string() });
        })
    }

    pub fn rename_group(&mut self, id: u32, title: &str) -> Result<()> {
        self.try_mutate(|h| {
            if let Some(g) = h.groups.iter_mut().find(|g| g.id == id) {
                g.title = title.to_string();
            }
        })
    }

    pub fn remove_group(&mut self, id: u32) -> Result<()> {
        self.try_mutate(|h| h.groups.retain(|g| g.id != id))
    }

    pub fn ungroup_track(&mut self, track: u32) -> Result<()> {
        self.try_mutate(|h| {
            for g in h.groups.iter_mut() {
                if g.id == 0 {
                    continue;
                }
                if g.first == track && g.last.unwrap_or(track) == track {
                    g.first = 0;
                }
            }
            h.groups.retain(|g| !(g.id != 0 && g.first == 0));
        })
    }

    pub fn add_track_to_group(&mut self, id: u32, track: u32) -> Result<()> {
        self.try_mutate(|h| {
            if let Some(g) = h.groups.iter_mut().find(|g| g.id == id) {
                let last = g.last.unwrap_or(g.first);
                if track < g.first {
                    g.first = track;
                }
                if track > last {
                    g.last = Some(track);
                }
            }
        })
    }

    pub fn remove_track_from_group(&mut self, id: u32, track: u32) -> Result<()> {
        self.try_mutate(|h| {
            if let Some(g) = h.groups.iter_mut().find(|g| g.id == id) {
                let last = g.last.unwrap_or(g.first);
                if track == g.first && track == last {
                    g.first = 0;
                } else if track == g.first {
                    g.first += 1;
                } else if track == last {
                    g.last = Some(last - 1);
                }
            }
            h.groups.retain(|g| !(g.id != 0 && g.first == 0));
        })
    }

    /// Removes a track entirely, shifting down the range of every group
    /// whose range lies entirely above it.
    pub fn remove_track(&mut self, track: u32) -> Result<()> {
        self.try_mutate(|h| {
            for g in h.groups.iter_mut() {
                if g.id == 0 {
                    continue;
                }
                let last = g.last.unwrap_or(g.first);
                if g.first > track {
                    g.first -= 1;
                    if let Some(l) = g.last {
                        g.last = Some(l - 1);
                    }
                } else if last > track && g.first <= track {
                    g.last = Some(last - 1);
                }
            }
        })
    }

    /// Returns the title of the group containing `track`, or an empty
    /// string if it is ungrouped.
    pub fn get_track_group(&self, track: u32) -> &str {
        for g in &self.groups {
            if g.id == 0 {
                continue;
            }
            let last = g.last.unwrap_or(g.first);
            if track >= g.first && track <= last {
                return &g.title;
            }
        }
        ""
    }
}

fn invalid(candidate: &mut DiscHeader) -> Error {
    candidate.groups.clear();
    Error::other("HeaderInvalid")
}

fn parse_range(s: &str) -> Option<(u32, Option<u32>)> {
    match s.split_once('-') {
        Some((a, b)) => Some((a.parse().ok()?, Some(b.parse().ok()?))),
        None => Some((s.parse().ok()?, None)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let s = "0;Hello//1;FirstGroup//2-3;Second//";
        let h = DiscHeader::parse(s).unwrap();
        assert_eq!(h.serialize(), s);
        assert_eq!(h.groups().count(), 2);
        assert_eq!(h.get_track_group(1), "FirstGroup");
        assert_eq!(h.get_track_group(2), "Second");
        assert_eq!(h.get_track_group(3), "Second");
        assert_eq!(h.get_track_group(5), "");
    }

    #[test]
    fn header_rejects_overlap() {
        let err = DiscHeader::parse("0;X//1-3;A//2-4;B//");
        assert!(err.is_err());
    }

    #[test]
    fn bare_title_has_no_groups() {
        let h = DiscHeader::parse("My Disc").unwrap();
        assert_eq!(h.disc_title(), "My Disc");
        assert_eq!(h.groups().count(), 0);
        assert_eq!(h.serialize(), "My Disc");
    }

    #[test]
    fn add_group_then_overlap_is_rejected_and_state_preserved() {
        let mut h = DiscHeader::parse("0;X//1-2;A//").unwrap();
        let before = h.serialize();
        let result = h.add_group(2, Some(3), "B");
        assert!(result.is_err());
        assert_eq!(h.serialize(), before);
    }

    #[test]
    fn remove_track_shifts_higher_groups_down() {
        let mut h = DiscHeader::parse("0;X//5-6;A//").unwrap();
        h.remove_track(2).unwrap();
        assert_eq!(h.serialize(), "0;X//4-5;A//");
    }
}
