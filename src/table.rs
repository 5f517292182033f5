/*! The stream table (`spec.md` §3 "Stream-Table", §4.4).

Two maps share the same value type (a pool index): a four-tuple map for
fully specified streams, and a listen map keyed by local address/port with
wildcard-address fallback for passive openers. Grounded in the teacher's own
choice of `rustc-hash` as its hot-path hasher is absent (`tapip-rs` has no
hash-map dependency to borrow from); the closest sibling in the retrieved
pack, `cs-wwu-srg-elvis-public`, depends on `rustc-hash` for exactly this
kind of table, so `FxHashMap` is used here and noted in `DESIGN.md`.
*/

use rustc_hash::FxHashMap;
use std::net::IpAddr;

use crate::timer::StreamIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourTuple {
    pub local_addr: IpAddr,
    pub local_port: u16,
    pub remote_addr: IpAddr,
    pub remote_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ListenKey {
    local_addr: Option<IpAddr>,
    local_port: u16,
}

#[derive(Debug, Default)]
pub struct StreamTable {
    connected: FxHashMap<FourTuple, StreamIndex>,
    listening: FxHashMap<ListenKey, StreamIndex>,
}

/// The outcome of a receive-path lookup: an established connection, a
/// listener to spawn a SYN_RCVD shadow entry from, or nothing at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Connected(StreamIndex),
    Listening(StreamIndex),
    None,
}

impl StreamTable {
    pub fn new() -> StreamTable {
        StreamTable::default()
    }

    pub fn insert_connected(&mut self, tuple: FourTuple, stream: StreamIndex) {
        self.connected.insert(tuple, stream);
    }

    pub fn remove_connected(&mut self, tuple: &FourTuple) {
        self.connected.remove(tuple);
    }

    pub fn insert_listening(&mut self, local_addr: Option<IpAddr>, local_port: u16, stream: StreamIndex) {
        self.listening.insert(
            ListenKey {
                local_addr,
                local_port,
            },
            stream,
        );
    }

    pub fn remove_listening(&mut self, local_addr: Option<IpAddr>, local_port: u16) {
        self.listening.remove(&ListenKey {
            local_addr,
            local_port,
        });
    }

    /// §4.4: "a full-tuple lookup is attempted first; failing that, a
    /// listen lookup," itself falling back from a specific local address to
    /// the wildcard.
    pub fn lookup(&self, tuple: &FourTuple) -> Lookup {
        if let Some(&stream) = self.connected.get(tuple) {
            return Lookup::Connected(stream);
        }
        let specific = ListenKey {
            local_addr: Some(tuple.local_addr),
            local_port: tuple.local_port,
        };
        if let Some(&stream) = self.listening.get(&specific) {
            return Lookup::Listening(stream);
        }
        let wildcard = ListenKey {
            local_addr: None,
            local_port: tuple.local_port,
        };
        match self.listening.get(&wildcard) {
            Some(&stream) => Lookup::Listening(stream),
            None => Lookup::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn tuple() -> FourTuple {
        FourTuple {
            local_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            local_port: 80,
            remote_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            remote_port: 4000,
        }
    }

    #[test]
    fn full_tuple_hit_wins_over_listener() {
        let mut table = StreamTable::new();
        table.insert_listening(None, 80, 1);
        table.insert_connected(tuple(), 2);
        assert_eq!(table.lookup(&tuple()), Lookup::Connected(2));
    }

    #[test]
    fn falls_back_to_wildcard_listener() {
        let mut table = StreamTable::new();
        table.insert_listening(None, 80, 7);
        assert_eq!(table.lookup(&tuple()), Lookup::Listening(7));
    }

    #[test]
    fn specific_listener_beats_wildcard() {
        let mut table = StreamTable::new();
        table.insert_listening(None, 80, 7);
        table.insert_listening(Some(tuple().local_addr), 80, 9);
        assert_eq!(table.lookup(&tuple()), Lookup::Listening(9));
    }

    #[test]
    fn miss_when_nothing_matches() {
        let table = StreamTable::new();
        assert_eq!(table.lookup(&tuple()), Lookup::None);
    }
}
