//! Ranked I/O chains.
//!
//! Every port carries an input, an output and a notify chain. A chain is an
//! ordered set of links grouped by [`ChainRank`]; running the chain hands the
//! packet list to each link in rank order until the list is empty or a link
//! fails. Links may consume packets (filtering, queueing, terminal delivery)
//! and the chain accounts for what each rank ate.

use std::fmt::{self, Write as _};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::port::PortId;
use crate::pktlist::PacketList;
use crate::status::{NetError, NetResult};

/// Position of a link in its chain. Links run rank by rank in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChainRank {
    PreFilter = 0,
    Filter = 1,
    PostFilter = 2,
    Queue = 3,
    PostQueue = 4,
    /// At most one link; delivers whatever is left.
    Terminal = 5,
}

impl ChainRank {
    pub const ALL: [ChainRank; 6] = [
        ChainRank::PreFilter,
        ChainRank::Filter,
        ChainRank::PostFilter,
        ChainRank::Queue,
        ChainRank::PostQueue,
        ChainRank::Terminal,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// One stage of a chain.
pub trait ChainCall: Send + Sync {
    /// Name used for removal by call and in reports.
    fn name(&self) -> &str;

    /// Processes `list` on behalf of `port`. Packets removed from the list
    /// are now owned by the link.
    fn call(&self, port: PortId, list: &mut PacketList) -> NetResult<()>;

    /// Runs once after the link is inserted.
    fn inserted(&self) {}

    /// Runs once after the link is removed.
    fn removed(&self) {}
}

/// Handle to an inserted link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(u64);

struct ChainLink {
    id: LinkId,
    modifies_list: bool,
    call: Arc<dyn ChainCall>,
}

/// Counters kept per chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChainStats {
    pub starts: u64,
    pub resumes: u64,
    pub errors: u64,
    pub pkts_started: u64,
    pub pkts_passed: u64,
    pub pkts_filtered: u64,
    pub pkts_queued: u64,
    pub pkts_dropped: u64,
}

/// Ordered set of ranked links.
pub struct IoChain {
    ranks: [Vec<ChainLink>; 6],
    modifies_list: u32,
    next_link: u64,
    stats: ChainStats,
}

impl Default for IoChain {
    fn default() -> Self {
        Self::new()
    }
}

impl IoChain {
    pub fn new() -> Self {
        Self {
            ranks: Default::default(),
            modifies_list: 0,
            next_link: 1,
            stats: ChainStats::default(),
        }
    }

    pub fn stats(&self) -> &ChainStats {
        &self.stats
    }

    pub fn clear_stats(&mut self) {
        self.stats = ChainStats::default();
    }

    pub fn is_empty(&self) -> bool {
        self.ranks.iter().all(Vec::is_empty)
    }

    pub fn len(&self) -> usize {
        self.ranks.iter().map(Vec::len).sum()
    }

    /// Number of links that may consume or reorder packets.
    pub fn modifies_list(&self) -> u32 {
        self.modifies_list
    }

    /// Inserts `call` at the front of `rank`.
    pub fn insert_call(
        &mut self,
        rank: ChainRank,
        call: Arc<dyn ChainCall>,
        modifies_list: bool,
    ) -> NetResult<LinkId> {
        if rank == ChainRank::Terminal && !self.ranks[rank.index()].is_empty() {
            return Err(NetError::busy(format!(
                "terminal link slot (wanted by {})",
                call.name()
            )));
        }
        let id = LinkId(self.next_link);
        self.next_link += 1;
        if modifies_list {
            self.modifies_list += 1;
        }
        debug!(?rank, name = call.name(), "chain link inserted");
        self.ranks[rank.index()].insert(
            0,
            ChainLink {
                id,
                modifies_list,
                call: Arc::clone(&call),
            },
        );
        call.inserted();
        Ok(id)
    }

    fn remove_at(&mut self, rank: usize, pos: usize) {
        let link = self.ranks[rank].remove(pos);
        if link.modifies_list {
            self.modifies_list -= 1;
        }
        link.call.removed();
    }

    /// Removes one link. Returns false if it was not in the chain.
    pub fn remove_link(&mut self, id: LinkId) -> bool {
        for rank in 0..self.ranks.len() {
            if let Some(pos) = self.ranks[rank].iter().position(|l| l.id == id) {
                self.remove_at(rank, pos);
                return true;
            }
        }
        false
    }

    /// Removes every link whose call is named `name`.
    pub fn remove_call(&mut self, name: &str) -> usize {
        let mut removed = 0;
        for rank in 0..self.ranks.len() {
            while let Some(pos) = self.ranks[rank].iter().position(|l| l.call.name() == name) {
                self.remove_at(rank, pos);
                removed += 1;
            }
        }
        removed
    }

    /// Removes every link.
    pub fn release(&mut self) {
        for rank in 0..self.ranks.len() {
            while !self.ranks[rank].is_empty() {
                self.remove_at(rank, 0);
            }
        }
    }

    /// Runs the chain from the first link.
    pub fn start(&mut self, port: PortId, list: &mut PacketList) -> NetResult<()> {
        self.resume(port, None, list)
    }

    /// Runs the chain starting after `prev`, or from the beginning when
    /// `prev` is `None`.
    ///
    /// When the chain contains links that modify lists and `list` is marked
    /// read-only, the chain runs on a clone and the clone's leftovers are
    /// completed, leaving `list` untouched.
    pub fn resume(
        &mut self,
        port: PortId,
        prev: Option<LinkId>,
        list: &mut PacketList,
    ) -> NetResult<()> {
        let (mut rank, mut pos) = match prev {
            None => {
                self.stats.starts += 1;
                self.stats.pkts_started += list.count() as u64;
                (0, 0)
            }
            Some(id) => {
                self.stats.resumes += 1;
                match self.locate(id) {
                    Some((rank, pos)) => (rank, pos + 1),
                    None => {
                        warn!(%port, "resume from a link no longer in the chain");
                        self.stats.errors += 1;
                        return Err(NetError::failure("resume link not found"));
                    }
                }
            }
        };

        let mut cloned = None;
        if self.modifies_list > 0 && !list.may_modify() {
            cloned = Some(list.clone_list());
        }
        let work = match cloned.as_mut() {
            Some(c) => c,
            None => list,
        };

        let mut result = Ok(());
        'ranks: while rank < self.ranks.len() {
            let before = work.count();
            while pos < self.ranks[rank].len() {
                if work.is_empty() {
                    break 'ranks;
                }
                let call = Arc::clone(&self.ranks[rank][pos].call);
                if let Err(e) = call.call(port, work) {
                    debug!(%port, link = call.name(), error = %e, "chain link failed");
                    result = Err(e);
                    break 'ranks;
                }
                pos += 1;
            }
            let eaten = (before - work.count()) as u64;
            match ChainRank::ALL[rank] {
                ChainRank::Terminal => self.stats.pkts_passed += eaten,
                ChainRank::Filter => self.stats.pkts_filtered += eaten,
                ChainRank::Queue => self.stats.pkts_queued += eaten,
                _ => self.stats.pkts_dropped += eaten,
            }
            rank += 1;
            pos = 0;
        }

        let left = work.count() as u64;
        match result {
            Ok(()) => self.stats.pkts_passed += left,
            Err(_) => {
                self.stats.errors += 1;
                self.stats.pkts_dropped += left;
            }
        }

        if let Some(mut c) = cloned {
            c.complete_all();
        }
        result
    }

    fn locate(&self, id: LinkId) -> Option<(usize, usize)> {
        self.ranks
            .iter()
            .enumerate()
            .find_map(|(r, links)| links.iter().position(|l| l.id == id).map(|p| (r, p)))
    }

    /// Link names in execution order, with their ranks.
    pub fn links(&self) -> Vec<(ChainRank, String)> {
        ChainRank::ALL
            .iter()
            .flat_map(|&rank| {
                self.ranks[rank.index()]
                    .iter()
                    .map(move |l| (rank, l.call.name().to_string()))
            })
            .collect()
    }

    /// Appends a human-readable summary under `title`.
    pub fn write_report(&self, title: &str, out: &mut String) -> fmt::Result {
        let s = &self.stats;
        writeln!(out, "{title}:")?;
        writeln!(
            out,
            "   starts {} resumes {} errors {}",
            s.starts, s.resumes, s.errors
        )?;
        writeln!(
            out,
            "   pkts started {} passed {} filtered {} queued {} dropped {}",
            s.pkts_started, s.pkts_passed, s.pkts_filtered, s.pkts_queued, s.pkts_dropped
        )?;
        for (rank, name) in self.links() {
            writeln!(out, "   -> {}:{}", rank as u8, name)?;
        }
        Ok(())
    }
}

impl fmt::Debug for IoChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoChain")
            .field("links", &self.links())
            .field("modifies_list", &self.modifies_list)
            .field("stats", &self.stats)
            .finish()
    }
}
