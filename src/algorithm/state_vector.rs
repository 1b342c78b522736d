// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{cmp::Ordering, collections::BTreeMap, fmt};

use anyhow::{Context, Result, bail};

/// A sparse causal clock: one non-negative counter per user id.
///
/// Absent components are zero. The map only ever grows along the time axis
/// of a given user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct StateVector {
    components: BTreeMap<u32, u32>,
}

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The component for `user`; zero when absent.
    pub fn get(&self, user: u32) -> u32 {
        self.components.get(&user).copied().unwrap_or(0)
    }

    pub fn set(&mut self, user: u32, value: u32) {
        if value == 0 {
            self.components.remove(&user);
        } else {
            self.components.insert(user, value);
        }
    }

    /// Adds `n` to the component for `user`.
    pub fn add(&mut self, user: u32, n: u32) {
        if n != 0 {
            *self.components.entry(user).or_insert(0) += n;
        }
    }

    /// Returns a copy with the `user` component decreased by one.
    pub fn minus_one(&self, user: u32) -> Self {
        let mut out = self.clone();
        let cur = out.get(user);
        debug_assert!(cur > 0, "minus_one on zero component");
        out.set(user, cur.saturating_sub(1));
        out
    }

    /// Component-wise partial order. `None` when the vectors are
    /// incomparable (concurrent).
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        let mut less = false;
        let mut greater = false;

        let users = self
            .components
            .keys()
            .chain(other.components.keys())
            .copied()
            .collect::<std::collections::BTreeSet<_>>();

        for user in users {
            match self.get(user).cmp(&other.get(user)) {
                Ordering::Less => less = true,
                Ordering::Greater => greater = true,
                Ordering::Equal => {},
            }
        }

        match (less, greater) {
            (false, false) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Less),
            (false, true) => Some(Ordering::Greater),
            (true, true) => None,
        }
    }

    /// Whether an event at `self` happened-before an event at `other`.
    pub fn causes(&self, other: &Self) -> bool {
        matches!(
            self.compare(other),
            Some(Ordering::Less) | Some(Ordering::Equal)
        )
    }

    /// Iterates `(user, count)` pairs in ascending user order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.components.iter().map(|(u, n)| (*u, *n))
    }

    /// Canonical wire encoding: `u1:n1;u2:n2;…` in ascending user order,
    /// zero components omitted. The empty vector encodes as the empty
    /// string.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        for (user, count) in self.iter() {
            if !out.is_empty() {
                out.push(';');
            }
            out.push_str(&format!("{user}:{count}"));
        }
        out
    }

    pub fn decode(s: &str) -> Result<Self> {
        let mut out = Self::new();
        if s.is_empty() {
            return Ok(out);
        }
        for pair in s.split(';') {
            let (user, count) = pair
                .split_once(':')
                .with_context(|| format!("malformed vector component {pair:?}"))?;
            let user: u32 = user
                .parse()
                .with_context(|| format!("bad user id in vector component {pair:?}"))?;
            let count: u32 = count
                .parse()
                .with_context(|| format!("bad count in vector component {pair:?}"))?;
            if out.components.contains_key(&user) {
                bail!("duplicate user {user} in vector");
            }
            out.set(user, count);
        }
        Ok(out)
    }
}

impl fmt::Display for StateVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_order() {
        let mut a = StateVector::new();
        a.add(1, 2);
        let mut b = a.clone();
        b.add(2, 1);

        assert_eq!(a.compare(&b), Some(Ordering::Less));
        assert!(a.causes(&b));
        assert!(!b.causes(&a));

        let mut c = StateVector::new();
        c.add(3, 1);
        assert_eq!(b.compare(&c), None);
        assert!(!b.causes(&c));
        assert!(!c.causes(&b));
    }

    #[test]
    fn test_encode_decode_roundtrip() -> Result<()> {
        let mut v = StateVector::new();
        v.add(7, 3);
        v.add(1, 1);

        assert_eq!(v.encode(), "1:1;7:3");
        assert_eq!(StateVector::decode("1:1;7:3")?, v);
        assert_eq!(StateVector::decode("")?, StateVector::new());
        assert!(StateVector::decode("1:1;1:2").is_err());
        assert!(StateVector::decode("nonsense").is_err());
        Ok(())
    }

    #[test]
    fn test_zero_components_are_absent() {
        let mut v = StateVector::new();
        v.add(4, 1);
        let v = v.minus_one(4);
        assert_eq!(v.encode(), "");
        assert_eq!(v.get(4), 0);
    }
}
