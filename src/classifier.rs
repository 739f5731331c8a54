//! Deterministic classification: NBBO execution level, priority, urgency,
//! and flow direction layered on top of the aggregator verdict.

use crate::aggregator::Emission;
use crate::contract::OptionContract;
use crate::models::{
    exchange_name, ClassifiedTrade, ExecutionLevel, FlowDirection, OptionSide, Quote, TradeType,
    Urgency,
};

/// Price tolerance when placing a print against the NBBO
const LEVEL_EPSILON: f64 = 0.01;

/// Condition codes treated as aggressive executions for urgency/direction
pub const AGGRESSIVE_CONDITION_CODES: &[i32] = &[220, 229, 230];

/// Place a print relative to the NBBO. UNKNOWN iff the quote is absent or
/// unusable; anything between two tolerance bands snaps to the side of mid.
pub fn execution_level(price: f64, quote: Option<&Quote>) -> ExecutionLevel {
    let Some(quote) = quote else {
        return ExecutionLevel::Unknown;
    };
    if !quote.is_valid() {
        return ExecutionLevel::Unknown;
    }

    let bid = quote.bid;
    let ask = quote.ask;
    let mid = quote.mid();

    if price > ask + LEVEL_EPSILON {
        ExecutionLevel::AboveAsk
    } else if (price - ask).abs() <= LEVEL_EPSILON {
        ExecutionLevel::AtAsk
    } else if (price - mid).abs() <= LEVEL_EPSILON {
        ExecutionLevel::Mid
    } else if (price - bid).abs() <= LEVEL_EPSILON {
        ExecutionLevel::AtBid
    } else if price < bid - LEVEL_EPSILON {
        ExecutionLevel::BelowBid
    } else if price > mid {
        ExecutionLevel::AtAsk
    } else if price < mid {
        ExecutionLevel::AtBid
    } else {
        ExecutionLevel::Mid
    }
}

/// Priority 1 (highest) through 4, with a premium-gated highlight flag.
pub fn priority(trade_type: TradeType, level: ExecutionLevel, premium: f64) -> (u8, bool) {
    use ExecutionLevel::*;
    use TradeType::*;

    match (trade_type, level) {
        (_, Unknown) => (4, false),
        (Sweep | Block, AboveAsk) => (1, true),
        (Sweep | Block, AtAsk) => (2, premium >= 100_000.0),
        (Sweep | Block, AtBid) => (3, premium >= 250_000.0),
        (Sweep | Block, BelowBid | Mid) => (4, false),
        (Flow, AboveAsk | AtAsk) => (3, premium >= 200_000.0),
        (Flow, AtBid | Mid | BelowBid) => (4, premium >= 300_000.0),
    }
}

/// Premium contribution to the urgency score, capped at 30
fn premium_band(premium: f64) -> u8 {
    match premium {
        p if p >= 1_000_000.0 => 30,
        p if p >= 500_000.0 => 24,
        p if p >= 250_000.0 => 18,
        p if p >= 100_000.0 => 12,
        p if p >= 50_000.0 => 6,
        _ => 0,
    }
}

/// Additive urgency score in [0, 100]
pub fn urgency_score(
    trade_type: TradeType,
    sweep_exchange_count: u32,
    premium: f64,
    conditions: &[i32],
) -> u8 {
    let mut score = 0u32;

    if trade_type == TradeType::Sweep {
        score += 30;
        // One venue adds nothing; every extra venue adds 5, capped at 15.
        score += (sweep_exchange_count.saturating_sub(1) * 5).min(15);
    }
    if trade_type == TradeType::Block {
        score += 10;
    }
    score += premium_band(premium) as u32;
    if conditions
        .iter()
        .any(|c| AGGRESSIVE_CONDITION_CODES.contains(c))
    {
        score += 20;
    }

    score.min(100) as u8
}

/// CALL/PUT-symmetric direction inference. A missing quote never blocks a
/// direction; the trade-type rules alone can decide.
pub fn flow_direction(
    side: OptionSide,
    trade_type: TradeType,
    premium: f64,
    conditions: &[i32],
) -> FlowDirection {
    let aggressive = conditions
        .iter()
        .any(|c| AGGRESSIVE_CONDITION_CODES.contains(c));

    let directional = trade_type == TradeType::Sweep
        || (trade_type == TradeType::Block && premium >= 200_000.0)
        || (aggressive && premium >= 100_000.0);

    if !directional {
        return FlowDirection::Neutral;
    }
    match side {
        OptionSide::Call => FlowDirection::Bullish,
        OptionSide::Put => FlowDirection::Bearish,
    }
}

/// Assembles classified trades from aggregator emissions and quote context.
pub struct Classifier;

impl Classifier {
    pub fn classify(
        emission: &Emission,
        contract: &OptionContract,
        quote: Option<&Quote>,
    ) -> ClassifiedTrade {
        let trade = &emission.trade;
        let verdict = &emission.verdict;

        let premium = trade.price * trade.size as f64 * 100.0;
        let level = execution_level(trade.price, quote);
        let (priority, highlight) = priority(verdict.trade_type, level, premium);
        let score = urgency_score(
            verdict.trade_type,
            verdict.sweep_exchange_count,
            premium,
            &trade.conditions,
        );
        let direction = flow_direction(
            contract.side,
            verdict.trade_type,
            premium,
            &trade.conditions,
        );

        ClassifiedTrade {
            contract_symbol: trade.symbol.clone(),
            underlying: contract.underlying.clone(),
            expiry: contract.expiry,
            side: contract.side,
            strike: contract.strike,
            dte: contract.dte(),

            price: trade.price,
            size: trade.size,
            premium,
            exchange_id: trade.exchange_id,
            exchange_name: exchange_name(trade.exchange_id),
            conditions: trade.conditions.clone(),
            executed_at_ms: trade.executed_at_ms,
            sequence: trade.sequence,

            trade_type: verdict.trade_type,
            execution_level: level,
            priority,
            highlight,
            urgency: Urgency::from_score(score),
            flow_direction: direction,

            sweep_id: verdict.sweep_id,
            sweep_size: verdict.sweep_size,
            sweep_exchange_count: verdict.sweep_exchange_count,
            sweep_exchanges: verdict.sweep_exchanges.clone(),
            is_block: verdict.is_block,
            block_reason: verdict.block_reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quote(bid: f64, ask: f64) -> Quote {
        Quote {
            bid,
            ask,
            bid_size: 10,
            ask_size: 10,
            quoted_at_ms: 0,
        }
    }

    #[test]
    fn level_placement() {
        let q = quote(4.30, 4.45);
        assert_eq!(execution_level(4.50, Some(&q)), ExecutionLevel::AboveAsk);
        assert_eq!(execution_level(4.45, Some(&q)), ExecutionLevel::AtAsk);
        assert_eq!(execution_level(4.44, Some(&q)), ExecutionLevel::AtAsk);
        assert_eq!(execution_level(4.375, Some(&q)), ExecutionLevel::Mid);
        assert_eq!(execution_level(4.30, Some(&q)), ExecutionLevel::AtBid);
        assert_eq!(execution_level(4.20, Some(&q)), ExecutionLevel::BelowBid);
    }

    #[test]
    fn level_unknown_on_missing_or_invalid_quote() {
        assert_eq!(execution_level(4.40, None), ExecutionLevel::Unknown);
        assert_eq!(
            execution_level(4.40, Some(&quote(0.0, 4.45))),
            ExecutionLevel::Unknown
        );
        assert_eq!(
            execution_level(4.40, Some(&quote(4.45, 0.0))),
            ExecutionLevel::Unknown
        );
        assert_eq!(
            execution_level(4.40, Some(&quote(4.50, 4.45))),
            ExecutionLevel::Unknown
        );
    }

    #[test]
    fn level_snaps_to_nearest_side_of_mid() {
        // Wide quote: gaps between the tolerance bands exist.
        let q = quote(4.00, 5.00);
        // Between mid band and ask band, above mid
        assert_eq!(execution_level(4.80, Some(&q)), ExecutionLevel::AtAsk);
        // Between bid band and mid band, below mid
        assert_eq!(execution_level(4.20, Some(&q)), ExecutionLevel::AtBid);
    }

    #[test]
    fn priority_table() {
        use ExecutionLevel::*;
        use TradeType::*;

        assert_eq!(priority(Sweep, AboveAsk, 0.0), (1, true));
        assert_eq!(priority(Block, AboveAsk, 0.0), (1, true));
        assert_eq!(priority(Sweep, AtAsk, 50_000.0), (2, false));
        assert_eq!(priority(Sweep, AtAsk, 150_000.0), (2, true));
        assert_eq!(priority(Block, AtBid, 250_000.0), (3, true));
        assert_eq!(priority(Sweep, Mid, 10_000_000.0), (4, false));
        assert_eq!(priority(Sweep, BelowBid, 10_000_000.0), (4, false));
        assert_eq!(priority(Flow, AboveAsk, 199_000.0), (3, false));
        assert_eq!(priority(Flow, AtAsk, 250_000.0), (3, true));
        assert_eq!(priority(Flow, BelowBid, 100_000.0), (4, false));
        assert_eq!(priority(Flow, Mid, 350_000.0), (4, true));
        assert_eq!(priority(Sweep, Unknown, 10_000_000.0), (4, false));
        assert_eq!(priority(Flow, Unknown, 10_000_000.0), (4, false));
    }

    #[test]
    fn priority_never_drops_across_buy_side_levels() {
        use ExecutionLevel::*;
        // ABOVE_ASK -> AT_ASK -> AT_BID must be non-decreasing numerically.
        for tt in [TradeType::Sweep, TradeType::Block] {
            for premium in [0.0, 120_000.0, 400_000.0] {
                let (p1, _) = priority(tt, AboveAsk, premium);
                let (p2, _) = priority(tt, AtAsk, premium);
                let (p3, _) = priority(tt, AtBid, premium);
                assert!(p1 <= p2 && p2 <= p3);
            }
        }
    }

    #[test]
    fn urgency_components() {
        // Sweep across 3 venues, small premium: 30 + 10
        assert_eq!(urgency_score(TradeType::Sweep, 3, 22_000.0, &[]), 40);
        // Venue bonus caps at 15
        assert_eq!(urgency_score(TradeType::Sweep, 10, 0.0, &[]), 45);
        // Block base + premium band
        assert_eq!(urgency_score(TradeType::Block, 0, 600_000.0, &[]), 34);
        // Aggressive code bonus
        assert_eq!(urgency_score(TradeType::Flow, 0, 0.0, &[220]), 20);
        // Everything together saturates at 100
        assert_eq!(
            urgency_score(TradeType::Sweep, 8, 2_000_000.0, &[229]),
            95
        );
    }

    #[test]
    fn direction_rules() {
        use FlowDirection::*;
        use OptionSide::*;
        use TradeType::*;

        assert_eq!(flow_direction(Call, Sweep, 1_000.0, &[]), Bullish);
        assert_eq!(flow_direction(Put, Sweep, 1_000.0, &[]), Bearish);

        assert_eq!(flow_direction(Call, Block, 250_000.0, &[]), Bullish);
        assert_eq!(flow_direction(Call, Block, 150_000.0, &[]), Neutral);
        assert_eq!(flow_direction(Put, Block, 250_000.0, &[]), Bearish);

        assert_eq!(flow_direction(Call, Flow, 150_000.0, &[230]), Bullish);
        assert_eq!(flow_direction(Call, Flow, 50_000.0, &[230]), Neutral);
        assert_eq!(flow_direction(Put, Flow, 150_000.0, &[229]), Bearish);

        assert_eq!(flow_direction(Call, Flow, 500_000.0, &[]), Neutral);
    }
}
