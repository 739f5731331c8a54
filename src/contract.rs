//! OCC-style option symbol parsing.
//!
//! The upstream feed identifies contracts as
//! `O:<TICKER><YYMMDD><C|P><STRIKE8>` where the strike carries eight digits
//! of thousandths of a dollar. Runs on every trade print, so parsing scans
//! bytes once and allocates only for the retained ticker.

use chrono::{Datelike, NaiveDate, Utc};

use crate::models::OptionSide;

/// Immutable contract identity decoded from an option symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct OptionContract {
    pub underlying: String,
    pub expiry: NaiveDate,
    pub side: OptionSide,
    pub strike: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedSymbol {
    pub symbol: String,
}

impl std::fmt::Display for MalformedSymbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "malformed option symbol: {}", self.symbol)
    }
}

impl std::error::Error for MalformedSymbol {}

impl OptionContract {
    /// Decode `O:<TICKER><YYMMDD|YYYMMDD><C|P><STRIKE8>`.
    ///
    /// The ticker is the leading alphabetic run; the date run may carry a
    /// seventh leading digit (some weekly listings), in which case the
    /// trailing six digits hold the date. The strike is exactly eight digits.
    pub fn parse(symbol: &str) -> Result<Self, MalformedSymbol> {
        let malformed = || MalformedSymbol {
            symbol: symbol.to_string(),
        };

        let body = symbol.strip_prefix("O:").ok_or_else(malformed)?;
        let bytes = body.as_bytes();

        let ticker_len = bytes
            .iter()
            .take_while(|b| b.is_ascii_alphabetic())
            .count();
        if ticker_len == 0 {
            return Err(malformed());
        }

        let rest = &bytes[ticker_len..];
        let date_len = rest.iter().take_while(|b| b.is_ascii_digit()).count();

        // Layout after the date run: one side letter then eight strike digits.
        // A date run of 14+ digits would swallow the side letter, so the run
        // itself must be 6 or 7 long.
        if !(date_len == 6 || date_len == 7) || rest.len() != date_len + 1 + 8 {
            return Err(malformed());
        }

        let date_digits = &rest[date_len - 6..date_len];
        let side = match rest[date_len] {
            b'C' => OptionSide::Call,
            b'P' => OptionSide::Put,
            _ => return Err(malformed()),
        };

        let strike_digits = &rest[date_len + 1..];
        if !strike_digits.iter().all(|b| b.is_ascii_digit()) {
            return Err(malformed());
        }

        let yy = digits_to_u32(&date_digits[0..2]);
        let mm = digits_to_u32(&date_digits[2..4]);
        let dd = digits_to_u32(&date_digits[4..6]);
        let expiry =
            NaiveDate::from_ymd_opt(2000 + yy as i32, mm, dd).ok_or_else(malformed)?;

        let thousandths = digits_to_u64(strike_digits);
        if thousandths == 0 {
            return Err(malformed());
        }
        let strike = thousandths as f64 / 1000.0;

        Ok(Self {
            underlying: body[..ticker_len].to_string(),
            expiry,
            side,
            strike,
        })
    }

    /// Days to expiration relative to the current UTC date, floored at zero
    /// for same-day expiry.
    pub fn dte(&self) -> i64 {
        self.dte_from(Utc::now().date_naive())
    }

    pub fn dte_from(&self, today: NaiveDate) -> i64 {
        (self.expiry - today).num_days().max(0)
    }

    /// Re-encode into the upstream symbol form.
    pub fn to_symbol(&self) -> String {
        format!(
            "O:{}{:02}{:02}{:02}{}{:08}",
            self.underlying,
            self.expiry.year() % 100,
            self.expiry.month(),
            self.expiry.day(),
            match self.side {
                OptionSide::Call => 'C',
                OptionSide::Put => 'P',
            },
            (self.strike * 1000.0).round() as u64,
        )
    }
}

#[inline]
fn digits_to_u32(digits: &[u8]) -> u32 {
    digits.iter().fold(0u32, |acc, b| acc * 10 + (b - b'0') as u32)
}

#[inline]
fn digits_to_u64(digits: &[u8]) -> u64 {
    digits.iter().fold(0u64, |acc, b| acc * 10 + (b - b'0') as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_call() {
        let c = OptionContract::parse("O:AMD251219C00155000").unwrap();
        assert_eq!(c.underlying, "AMD");
        assert_eq!(c.expiry, NaiveDate::from_ymd_opt(2025, 12, 19).unwrap());
        assert_eq!(c.side, OptionSide::Call);
        assert!((c.strike - 155.0).abs() < 1e-9);
    }

    #[test]
    fn parses_put() {
        let c = OptionContract::parse("O:SPY251115P00580000").unwrap();
        assert_eq!(c.underlying, "SPY");
        assert_eq!(c.side, OptionSide::Put);
        assert!((c.strike - 580.0).abs() < 1e-9);
    }

    #[test]
    fn parses_fractional_strike() {
        let c = OptionContract::parse("O:F260116C00012500").unwrap();
        assert!((c.strike - 12.5).abs() < 1e-9);
    }

    #[test]
    fn parses_seven_digit_date_run() {
        // Trailing six digits carry the date when the run is seven long.
        let c = OptionContract::parse("O:SPXW1251219C05800000").unwrap();
        assert_eq!(c.underlying, "SPXW");
        assert_eq!(c.expiry, NaiveDate::from_ymd_opt(2025, 12, 19).unwrap());
        assert!((c.strike - 5800.0).abs() < 1e-9);
    }

    #[test]
    fn rejects_malformed() {
        for bad in [
            "",
            "AMD251219C00155000",      // missing prefix
            "O:251219C00155000",       // no ticker
            "O:AMD25121C00155000",     // five-digit date
            "O:AMD251219X00155000",    // bad side letter
            "O:AMD251219C0015500",     // seven-digit strike
            "O:AMD251219C001550000",   // nine-digit strike
            "O:AMD251219C00000000",    // zero strike
            "O:AMD251340C00155000",    // month 13
            "O:AMD251219C0015500a",    // non-digit strike
        ] {
            assert!(OptionContract::parse(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn round_trip() {
        for (ticker, y, m, d, side, strike) in [
            ("AMD", 2025, 12, 19, OptionSide::Call, 155.0),
            ("SPY", 2025, 11, 15, OptionSide::Put, 580.0),
            ("F", 2026, 1, 16, OptionSide::Call, 12.5),
            ("TSLA", 2027, 6, 18, OptionSide::Put, 0.001),
            ("NVDA", 2025, 11, 22, OptionSide::Call, 145.0),
        ] {
            let contract = OptionContract {
                underlying: ticker.to_string(),
                expiry: NaiveDate::from_ymd_opt(y, m, d).unwrap(),
                side,
                strike,
            };
            let parsed = OptionContract::parse(&contract.to_symbol()).unwrap();
            assert_eq!(parsed, contract);
        }
    }

    #[test]
    fn dte_floors_at_zero() {
        let c = OptionContract::parse("O:AMD251219C00155000").unwrap();
        let before = NaiveDate::from_ymd_opt(2025, 12, 9).unwrap();
        let after = NaiveDate::from_ymd_opt(2025, 12, 25).unwrap();
        assert_eq!(c.dte_from(before), 10);
        assert_eq!(c.dte_from(after), 0);
    }
}
