//! Swap lifecycle state machine

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of one order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SwapState {
    Pending,
    EscrowedSrc,
    EscrowedDst,
    Fulfilled,
    Completed,
    Expired,
    Cancelled,
    Refunded,
}

impl SwapState {
    pub const ALL: [SwapState; 8] = [
        SwapState::Pending,
        SwapState::EscrowedSrc,
        SwapState::EscrowedDst,
        SwapState::Fulfilled,
        SwapState::Completed,
        SwapState::Expired,
        SwapState::Cancelled,
        SwapState::Refunded,
    ];

    /// Allowed transitions:
    /// `PENDING -> ESCROWED_SRC -> ESCROWED_DST -> FULFILLED -> COMPLETED`,
    /// any non-terminal state except `EXPIRED` to `EXPIRED` or `CANCELLED`,
    /// and `EXPIRED -> REFUNDED`.
    pub fn can_transition_to(&self, next: SwapState) -> bool {
        use SwapState::*;
        matches!(
            (self, next),
            (Pending, EscrowedSrc)
                | (EscrowedSrc, EscrowedDst)
                | (EscrowedDst, Fulfilled)
                | (Fulfilled, Completed)
                | (Pending | EscrowedSrc | EscrowedDst | Fulfilled, Expired | Cancelled)
                | (Expired, Refunded)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SwapState::Completed | SwapState::Cancelled | SwapState::Refunded)
    }

    /// Funds are locked on at least one chain
    pub fn is_escrowed(&self) -> bool {
        matches!(
            self,
            SwapState::EscrowedSrc | SwapState::EscrowedDst | SwapState::Fulfilled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SwapState::Pending => "PENDING",
            SwapState::EscrowedSrc => "ESCROWED_SRC",
            SwapState::EscrowedDst => "ESCROWED_DST",
            SwapState::Fulfilled => "FULFILLED",
            SwapState::Completed => "COMPLETED",
            SwapState::Expired => "EXPIRED",
            SwapState::Cancelled => "CANCELLED",
            SwapState::Refunded => "REFUNDED",
        }
    }
}

impl fmt::Display for SwapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SwapState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SwapState::ALL
            .iter()
            .find(|state| state.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown swap state: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SwapState::*;

    #[test]
    fn happy_path_is_linear() {
        let path = [Pending, EscrowedSrc, EscrowedDst, Fulfilled, Completed];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        assert!(!Pending.can_transition_to(EscrowedDst));
        assert!(!EscrowedSrc.can_transition_to(Completed));
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for from in [Completed, Cancelled, Refunded] {
            assert!(from.is_terminal());
            for to in SwapState::ALL {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn expiry_leads_only_to_refund() {
        for to in SwapState::ALL {
            assert_eq!(Expired.can_transition_to(to), to == Refunded);
        }
        assert!(Fulfilled.can_transition_to(Expired));
        assert!(Pending.can_transition_to(Cancelled));
    }

    #[test]
    fn names_are_stable() {
        assert_eq!(
            serde_json::to_string(&EscrowedSrc).unwrap(),
            "\"ESCROWED_SRC\""
        );
        for state in SwapState::ALL {
            assert_eq!(state.as_str().parse::<SwapState>().unwrap(), state);
        }
    }
}
