use crate::{
    error::LedgerError,
    trade::{Instrument, Side, TradeEvent, UserId},
};
use fnv::FnvHashMap;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    fs::File,
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tracing::{error, info, warn};

/// Background tasks draining the stats queue and maintaining the ledger.
pub mod worker;

/// Cumulative activity of one user on one instrument.
///
/// Counts and volumes only ever increase; the only way a `UserStat` shrinks is eviction of the
/// whole entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct UserStat {
    pub buy_count: u64,
    pub sell_count: u64,
    #[serde(with = "rust_decimal::serde::str")]
    pub buy_volume: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub sell_volume: Decimal,
}

impl UserStat {
    /// Count one trade of `side`. Volumes saturate at [`Decimal::MAX`].
    pub fn record(&mut self, side: Side, notional: Decimal) {
        match side {
            Side::Buy => {
                self.buy_count += 1;
                self.buy_volume = self.buy_volume.saturating_add(notional);
            }
            Side::Sell => {
                self.sell_count += 1;
                self.sell_volume = self.sell_volume.saturating_add(notional);
            }
        }
    }

    pub fn total_volume(&self) -> Decimal {
        self.buy_volume.saturating_add(self.sell_volume)
    }

    pub fn total_count(&self) -> u64 {
        self.buy_count + self.sell_count
    }
}

/// [`UserStat`] of one user over a query window.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct UserWindowStat {
    pub user: UserId,
    #[serde(flatten)]
    pub stat: UserStat,
}

type UserBook = HashMap<UserId, UserStat>;

/// Durable per-instrument, per-user cumulative statistics.
///
/// Mutated only through [`StatsLedger::apply`] (by the ledger consumer) and
/// [`StatsLedger::evict_excess`]; snapshots are written atomically to a JSON file laid out as
/// `{instrument: {user: stat}}`.
#[derive(Debug)]
pub struct StatsLedger {
    path: PathBuf,
    max_users: usize,
    books: RwLock<FnvHashMap<Instrument, UserBook>>,
    /// Changed since the last successful snapshot.
    dirty: AtomicBool,
}

impl StatsLedger {
    /// Empty ledger snapshotting to `path`.
    pub fn new(path: impl Into<PathBuf>, max_users: usize) -> Self {
        Self {
            path: path.into(),
            max_users,
            books: RwLock::new(FnvHashMap::default()),
            dirty: AtomicBool::new(false),
        }
    }

    /// Ledger restored from the snapshot at `path`.
    ///
    /// A missing snapshot yields an empty ledger. An unreadable or corrupt snapshot is logged
    /// and also yields an empty ledger.
    pub fn load(path: impl Into<PathBuf>, max_users: usize) -> Self {
        let ledger = Self::new(path, max_users);

        match read_snapshot(&ledger.path) {
            Ok(Some(books)) => {
                let users: usize = books.values().map(HashMap::len).sum();
                info!(
                    path = %ledger.path.display(),
                    instruments = books.len(),
                    users,
                    "loaded ledger snapshot"
                );
                *ledger.books.write() = books;
            }
            Ok(None) => {
                info!(path = %ledger.path.display(), "no ledger snapshot found, starting empty");
            }
            Err(error) => {
                error!(
                    path = %ledger.path.display(),
                    %error,
                    "failed to load ledger snapshot, starting empty"
                );
            }
        }

        ledger
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Credit `trade` to its aggressor: the buyer of a buy, the seller of a sell.
    ///
    /// Returns `false` (and changes nothing) when that participant is unknown.
    pub fn apply(&self, trade: &TradeEvent) -> bool {
        let user = trade.aggressor();
        if user.is_unknown() {
            return false;
        }

        self.books
            .write()
            .entry(trade.instrument.clone())
            .or_default()
            .entry(user.clone())
            .or_default()
            .record(trade.side, trade.notional);
        self.dirty.store(true, Ordering::Release);
        true
    }

    /// Copy of the per-user statistics of `instrument` (empty if none recorded).
    pub fn cumulative_stats(&self, instrument: &Instrument) -> HashMap<UserId, UserStat> {
        self.books
            .read()
            .get(instrument)
            .cloned()
            .unwrap_or_default()
    }

    pub fn user_count(&self, instrument: &Instrument) -> usize {
        self.books.read().get(instrument).map_or(0, HashMap::len)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Trim every instrument holding more than `max_users` users down to the most active ones,
    /// ranked by total volume then total count (descending), ties broken by user id.
    ///
    /// Returns the number of users evicted.
    pub fn evict_excess(&self) -> usize {
        let mut books = self.books.write();
        let mut evicted = 0;

        for (instrument, book) in books.iter_mut() {
            if book.len() <= self.max_users {
                continue;
            }

            let mut ranked: Vec<(UserId, UserStat)> = book.drain().collect();
            ranked.sort_by(|(a_user, a), (b_user, b)| {
                b.total_volume()
                    .cmp(&a.total_volume())
                    .then_with(|| b.total_count().cmp(&a.total_count()))
                    .then_with(|| a_user.cmp(b_user))
            });

            let removed = ranked.len() - self.max_users;
            ranked.truncate(self.max_users);
            *book = ranked.into_iter().collect();
            evicted += removed;

            info!(
                %instrument,
                removed,
                retained = book.len(),
                "evicted least active ledger users"
            );
        }

        if evicted > 0 {
            self.dirty.store(true, Ordering::Release);
        }
        evicted
    }

    /// Write a snapshot if anything changed since the last one.
    ///
    /// The snapshot is written to a temporary file in the same directory and renamed over the
    /// previous one. Returns whether a snapshot was written.
    pub fn persist(&self) -> Result<bool, LedgerError> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }

        let result = self.write_snapshot();
        if result.is_err() {
            self.dirty.store(true, Ordering::Release);
        }
        result.map(|()| true)
    }

    /// [`StatsLedger::persist`] on the blocking thread pool.
    pub async fn persist_blocking(self: &Arc<Self>) -> Result<bool, LedgerError> {
        let ledger = Arc::clone(self);
        tokio::task::spawn_blocking(move || ledger.persist())
            .await
            .map_err(|error| LedgerError::Task(error.to_string()))?
    }

    fn write_snapshot(&self) -> Result<(), LedgerError> {
        let payload = {
            let books = self.books.read();
            let ordered: BTreeMap<&Instrument, BTreeMap<&UserId, &UserStat>> = books
                .iter()
                .map(|(instrument, book)| (instrument, book.iter().collect()))
                .collect();
            serde_json::to_vec_pretty(&ordered)?
        };

        if let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|error| LedgerError::io(parent, error))?;
        }

        let tmp = tmp_path(&self.path);
        let mut file = File::create(&tmp).map_err(|error| LedgerError::io(&tmp, error))?;
        file.write_all(&payload)
            .and_then(|()| file.sync_all())
            .map_err(|error| LedgerError::io(&tmp, error))?;
        std::fs::rename(&tmp, &self.path).map_err(|error| LedgerError::io(&self.path, error))?;

        info!(
            path = %self.path.display(),
            bytes = payload.len(),
            "ledger snapshot written"
        );
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_else(|| "ledger.json".into());
    name.push(".tmp");
    path.with_file_name(name)
}

fn read_snapshot(path: &Path) -> Result<Option<FnvHashMap<Instrument, UserBook>>, LedgerError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
        Err(error) => return Err(LedgerError::io(path, error)),
    };

    if bytes.iter().all(u8::is_ascii_whitespace) {
        warn!(path = %path.display(), "ledger snapshot is empty");
        return Ok(None);
    }

    Ok(Some(serde_json::from_slice(&bytes)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trade::test_utils::trade;
    use rust_decimal_macros::dec;

    fn trade_by(seq: u64, side: Side, notional: Decimal, user: &str) -> TradeEvent {
        let mut trade = trade(seq, side, notional, 0);
        match side {
            Side::Buy => trade.buyer = UserId::new(user),
            Side::Sell => trade.seller = UserId::new(user),
        }
        trade
    }

    fn btc() -> Instrument {
        Instrument::new("BTC")
    }

    #[test]
    fn test_apply_credits_aggressor() {
        let ledger = StatsLedger::new("unused.json", 100);

        assert!(ledger.apply(&trade_by(1, Side::Buy, dec!(100), "0xa")));
        assert!(ledger.apply(&trade_by(2, Side::Sell, dec!(40), "0xa")));
        assert!(ledger.apply(&trade_by(3, Side::Buy, dec!(1.5), "0xa")));
        assert!(!ledger.apply(&trade_by(4, Side::Buy, dec!(100), "")));

        let stats = ledger.cumulative_stats(&btc());
        assert_eq!(stats.len(), 1);
        assert_eq!(
            stats[&UserId::new("0xa")],
            UserStat {
                buy_count: 2,
                sell_count: 1,
                buy_volume: dec!(101.5),
                sell_volume: dec!(40),
            }
        );
        assert!(ledger.cumulative_stats(&Instrument::new("ETH")).is_empty());
    }

    #[test]
    fn test_counts_are_monotonic() {
        let ledger = StatsLedger::new("unused.json", 100);
        let user = UserId::new("0xa");
        let mut previous = UserStat::default();

        for seq in 0..50u64 {
            let side = if seq % 4 == 0 { Side::Sell } else { Side::Buy };
            ledger.apply(&trade_by(seq, side, Decimal::from(seq + 1), "0xa"));

            let current = ledger.cumulative_stats(&btc())[&user];
            assert!(current.buy_count >= previous.buy_count);
            assert!(current.sell_count >= previous.sell_count);
            assert!(current.buy_volume >= previous.buy_volume);
            assert!(current.sell_volume >= previous.sell_volume);
            assert_eq!(current.total_count(), seq + 1);
            previous = current;
        }
    }

    #[test]
    fn test_volume_saturates_at_decimal_max() {
        let ledger = StatsLedger::new("unused.json", 100);
        let notional = Decimal::from_i128_with_scale(70_000_000_000_000_000_000_000_000_000, 0);

        assert!(ledger.apply(&trade_by(1, Side::Buy, notional, "0xwhale")));
        assert!(ledger.apply(&trade_by(2, Side::Buy, notional, "0xwhale")));
        assert!(ledger.apply(&trade_by(3, Side::Sell, notional, "0xwhale")));

        let stat = ledger.cumulative_stats(&btc())[&UserId::new("0xwhale")];
        assert_eq!(stat.buy_count, 2);
        assert_eq!(stat.buy_volume, Decimal::MAX);
        assert_eq!(stat.sell_volume, notional);
        assert_eq!(stat.total_volume(), Decimal::MAX);
        assert_eq!(ledger.evict_excess(), 0);
    }

    #[test]
    fn test_evict_keeps_top_users() {
        let ledger = StatsLedger::new("unused.json", 3);

        // (user, volumes) - 0xd and 0xe tie on volume, 0xe trades more often
        let users: [(&str, &[Decimal]); 6] = [
            ("0xa", &[dec!(500)]),
            ("0xb", &[dec!(10)]),
            ("0xc", &[dec!(300)]),
            ("0xd", &[dec!(200)]),
            ("0xe", &[dec!(100), dec!(100)]),
            ("0xf", &[dec!(1)]),
        ];
        let mut seq = 0;
        for (user, volumes) in users {
            for volume in volumes {
                seq += 1;
                ledger.apply(&trade_by(seq, Side::Buy, *volume, user));
            }
        }
        ledger.mark_clean();

        assert_eq!(ledger.evict_excess(), 3);
        assert!(ledger.is_dirty());

        let mut retained: Vec<String> = ledger
            .cumulative_stats(&btc())
            .into_keys()
            .map(|user| user.to_string())
            .collect();
        retained.sort();
        assert_eq!(retained, vec!["0xa", "0xc", "0xe"]);

        // Already within the cap
        assert_eq!(ledger.evict_excess(), 0);
    }

    #[test]
    fn test_evict_ties_broken_by_user_id() {
        let ledger = StatsLedger::new("unused.json", 2);
        for (seq, user) in ["0xc", "0xa", "0xb"].into_iter().enumerate() {
            ledger.apply(&trade_by(seq as u64, Side::Sell, dec!(5), user));
        }

        assert_eq!(ledger.evict_excess(), 1);
        let mut retained: Vec<String> = ledger
            .cumulative_stats(&btc())
            .into_keys()
            .map(|user| user.to_string())
            .collect();
        retained.sort();
        assert_eq!(retained, vec!["0xa", "0xb"]);
    }

    #[test]
    fn test_persist_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ledger.json");

        let ledger = StatsLedger::new(&path, 100);
        ledger.apply(&trade_by(1, Side::Buy, dec!(0.1), "0xa"));
        ledger.apply(&trade_by(2, Side::Sell, dec!(123456.789012345), "0xb"));
        let mut eth = trade_by(3, Side::Buy, dec!(7), "0xa");
        eth.instrument = Instrument::new("ETH");
        ledger.apply(&eth);

        assert!(ledger.persist().unwrap());
        assert!(!ledger.is_dirty());
        assert!(!tmp_path(&path).exists());

        // Nothing changed: snapshot skipped
        assert!(!ledger.persist().unwrap());

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains(r#""sell_volume": "123456.789012345""#));

        let restored = StatsLedger::load(&path, 100);
        assert_eq!(restored.cumulative_stats(&btc()), ledger.cumulative_stats(&btc()));
        assert_eq!(
            restored.cumulative_stats(&Instrument::new("ETH")),
            ledger.cumulative_stats(&Instrument::new("ETH"))
        );
        assert!(!restored.is_dirty());
    }

    #[test]
    fn test_load_missing_or_corrupt_is_empty() {
        let dir = tempfile::tempdir().unwrap();

        let missing = StatsLedger::load(dir.path().join("absent.json"), 10);
        assert_eq!(missing.user_count(&btc()), 0);

        let corrupt_path = dir.path().join("corrupt.json");
        std::fs::write(&corrupt_path, b"{\"BTC\": {\"0xa\": [1, 2").unwrap();
        let corrupt = StatsLedger::load(&corrupt_path, 10);
        assert_eq!(corrupt.user_count(&btc()), 0);

        // A corrupt snapshot is replaced by the next successful one
        corrupt.apply(&trade_by(1, Side::Buy, dec!(1), "0xa"));
        assert!(corrupt.persist().unwrap());
        assert_eq!(StatsLedger::load(&corrupt_path, 10).user_count(&btc()), 1);
    }

    impl StatsLedger {
        fn mark_clean(&self) {
            self.dirty.store(false, Ordering::Release);
        }
    }
}
