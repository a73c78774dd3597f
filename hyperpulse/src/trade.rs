use crate::error::ParseError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::fmt::{Display, Formatter};

/// Tradable symbol a [`TradeEvent`] belongs to (eg/ "BTC"), normalised to uppercase.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Deserialize, Serialize)]
#[serde(transparent)]
pub struct Instrument(SmolStr);

impl Instrument {
    pub fn new<S: AsRef<str>>(symbol: S) -> Self {
        Self(SmolStr::new(symbol.as_ref().trim().to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Display for Instrument {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Instrument {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Identity (wallet address) of a trade participant.
///
/// The feed may omit one or both participants, in which case the [`UserId::UNKNOWN`] sentinel
/// is used. Unknown participants never accrue statistics.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Deserialize, Serialize)]
#[serde(transparent)]
pub struct UserId(SmolStr);

impl UserId {
    pub const UNKNOWN: UserId = UserId(SmolStr::new_static("unknown"));

    pub fn new<S: AsRef<str>>(address: S) -> Self {
        let address = address.as_ref().trim();
        if address.is_empty() {
            Self::UNKNOWN
        } else {
            Self(SmolStr::new(address))
        }
    }

    pub fn is_unknown(&self) -> bool {
        *self == Self::UNKNOWN
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Aggressor side of an executed trade.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Deserialize, Serialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Parse the Hyperliquid wire representation: "B" (bid, buy) or "A" (ask, sell).
    pub fn from_wire(side: &str) -> Result<Self, ParseError> {
        match side {
            "B" | "b" | "Buy" | "buy" => Ok(Side::Buy),
            "A" | "a" | "Sell" | "sell" => Ok(Side::Sell),
            other => Err(ParseError::UnknownSide(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "Buy",
            Side::Sell => "Sell",
        }
    }

    pub fn is_buy(&self) -> bool {
        matches!(self, Side::Buy)
    }

    pub fn is_sell(&self) -> bool {
        matches!(self, Side::Sell)
    }
}

impl Display for Side {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Normalised executed trade.
///
/// Constructed through [`TradeEvent::new`], which validates price and quantity and derives
/// `notional = price × quantity` (any upstream notional is ignored).
#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub struct TradeEvent {
    /// Monotonic ingestion sequence number, unique within one process.
    pub seq: u64,
    /// Event time reported by the exchange (not receipt time).
    pub time: DateTime<Utc>,
    pub side: Side,
    pub price: Decimal,
    pub quantity: Decimal,
    pub notional: Decimal,
    pub instrument: Instrument,
    pub buyer: UserId,
    pub seller: UserId,
    /// Exchange trade id (`tid`), if provided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trade_id: Option<u64>,
    /// Exchange transaction hash, if provided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<SmolStr>,
}

impl TradeEvent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        seq: u64,
        time: DateTime<Utc>,
        side: Side,
        price: Decimal,
        quantity: Decimal,
        instrument: Instrument,
        buyer: UserId,
        seller: UserId,
    ) -> Result<Self, ParseError> {
        if price <= Decimal::ZERO {
            return Err(ParseError::NonPositive {
                field: "px",
                value: price.to_string(),
            });
        }
        if quantity <= Decimal::ZERO {
            return Err(ParseError::NonPositive {
                field: "sz",
                value: quantity.to_string(),
            });
        }
        let notional = price
            .checked_mul(quantity)
            .ok_or_else(|| ParseError::Malformed(format!("notional overflow: {price} × {quantity}")))?;

        Ok(Self {
            seq,
            time,
            side,
            price,
            quantity,
            notional,
            instrument,
            buyer,
            seller,
            trade_id: None,
            hash: None,
        })
    }

    pub fn with_trade_id(mut self, trade_id: Option<u64>) -> Self {
        self.trade_id = trade_id;
        self
    }

    pub fn with_hash(mut self, hash: Option<SmolStr>) -> Self {
        self.hash = hash;
        self
    }

    /// Participant credited by this trade: the buyer of a buy, the seller of a sell.
    pub fn aggressor(&self) -> &UserId {
        match self.side {
            Side::Buy => &self.buyer,
            Side::Sell => &self.seller,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_instrument_normalised() {
        assert_eq!(Instrument::new(" btc ").as_str(), "BTC");
        assert_eq!(Instrument::from("Eth"), Instrument::new("ETH"));
    }

    #[test]
    fn test_user_id_unknown_sentinel() {
        assert!(UserId::new("").is_unknown());
        assert!(UserId::new("unknown").is_unknown());
        assert!(!UserId::new("0xabc").is_unknown());
        assert_eq!(UserId::UNKNOWN.to_string(), "unknown");
    }

    #[test]
    fn test_side_from_wire() {
        struct TestCase {
            input: &'static str,
            expected: Result<Side, ParseError>,
        }

        let tests = vec![
            TestCase {
                // TC0: bid side is a buy
                input: "B",
                expected: Ok(Side::Buy),
            },
            TestCase {
                // TC1: ask side is a sell
                input: "A",
                expected: Ok(Side::Sell),
            },
            TestCase {
                // TC2: anything else is rejected
                input: "X",
                expected: Err(ParseError::UnknownSide("X".to_string())),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = Side::from_wire(test.input);
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_trade_event_derives_notional() {
        let trade = TradeEvent::new(
            1,
            Utc::now(),
            Side::Buy,
            dec!(65000.5),
            dec!(0.02),
            Instrument::new("BTC"),
            UserId::new("0xa"),
            UserId::new("0xb"),
        )
        .unwrap();

        assert_eq!(trade.notional, dec!(1300.010));
        assert_eq!(trade.aggressor(), &UserId::new("0xa"));
    }

    #[test]
    fn test_trade_event_rejects_non_positive() {
        let zero_price = TradeEvent::new(
            1,
            Utc::now(),
            Side::Sell,
            Decimal::ZERO,
            dec!(1),
            Instrument::new("BTC"),
            UserId::UNKNOWN,
            UserId::UNKNOWN,
        );
        assert!(matches!(
            zero_price,
            Err(ParseError::NonPositive { field: "px", .. })
        ));

        let negative_size = TradeEvent::new(
            1,
            Utc::now(),
            Side::Sell,
            dec!(1),
            dec!(-2),
            Instrument::new("BTC"),
            UserId::UNKNOWN,
            UserId::UNKNOWN,
        );
        assert!(matches!(
            negative_size,
            Err(ParseError::NonPositive { field: "sz", .. })
        ));
    }
}
