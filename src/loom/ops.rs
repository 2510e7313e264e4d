use std::{str::FromStr, sync::Arc};

use bytemuck::{Pod, Zeroable};
use derive_more::Display;
use itertools::Itertools;
use thiserror::Error;

use super::{
    MAX_TENSOR_OPERANDS, MAX_TENSOR_RANK,
    bounded::Bounded,
    device::{Location, Transfer},
    memory::SlabEntry,
    num::DataKind,
    tensor::Shape,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display)]
pub enum Access {
    ReadOnly,
    ReadWrite,
    WriteOnly,
}

/// Position of an operand in a contraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Role {
    Destination,
    Left,
    Right,
}

impl Role {
    pub const ALL: [Role; MAX_TENSOR_OPERANDS] = [Role::Destination, Role::Left, Role::Right];

    #[inline]
    pub fn access(self) -> Access {
        match self {
            Role::Destination => Access::ReadWrite,
            Role::Left | Role::Right => Access::ReadOnly,
        }
    }
}

/// What happens to an operand's copies once the operation completes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum CopyMode {
    /// The copy on the execution device is retained and the source stays valid.
    #[default]
    #[display("K")]
    Keep,
    /// The copy on the execution device is retained and the source is released.
    #[display("M")]
    Move,
    /// The copy on the execution device is a temporary owned by the task.
    /// For the destination, the result is written back to its source device.
    #[display("D")]
    Discard,
}

impl TryFrom<char> for CopyMode {
    type Error = CopyControlError;

    fn try_from(value: char) -> Result<Self, Self::Error> {
        match value.to_ascii_uppercase() {
            'K' => Ok(CopyMode::Keep),
            'M' => Ok(CopyMode::Move),
            // a temporary copy on the execution device
            'D' | 'T' => Ok(CopyMode::Discard),
            _ => Err(CopyControlError::Letter(value)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CopyControlError {
    #[error("copy control code must have 3 letters, found {0:?}")]
    Length(String),
    #[error("unknown copy control letter {0:?}")]
    Letter(char),
}

/// Per-operand copy policy of a contraction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[display("{destination}{left}{right}")]
pub struct CopyControl {
    pub destination: CopyMode,
    pub left: CopyMode,
    pub right: CopyMode,
}

impl CopyControl {
    /// Sources remain valid for use on other devices.
    pub const KEEP_ALL: Self = Self::new(CopyMode::Keep, CopyMode::Keep, CopyMode::Keep);
    /// No further reuse of the sources is needed.
    pub const MOVE_ALL: Self = Self::new(CopyMode::Move, CopyMode::Move, CopyMode::Move);
    /// The result moves to the execution device; inputs are kept.
    pub const MOVE_DESTINATION: Self = Self::new(CopyMode::Move, CopyMode::Keep, CopyMode::Keep);
    /// Nothing stays on the execution device; the result is written back.
    pub const DISCARD_ALL: Self = Self::new(CopyMode::Discard, CopyMode::Discard, CopyMode::Discard);

    pub const fn new(destination: CopyMode, left: CopyMode, right: CopyMode) -> Self {
        Self {
            destination,
            left,
            right,
        }
    }

    #[inline]
    pub fn get(&self, role: Role) -> CopyMode {
        match role {
            Role::Destination => self.destination,
            Role::Left => self.left,
            Role::Right => self.right,
        }
    }
}

impl FromStr for CopyControl {
    type Err = CopyControlError;

    /// Parses three-letter codes such as `"MTT"`: one of `K`, `M` or `D`/`T` per operand.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((d, l, r)) = s.chars().collect_tuple() else {
            return Err(CopyControlError::Length(s.into()));
        };
        Ok(Self::new(d.try_into()?, l.try_into()?, r.try_into()?))
    }
}

/// A tensor contraction `D += factor * L * R` described by an index pattern.
#[derive(Debug, Clone, PartialEq)]
pub struct Contraction {
    pub pattern: Arc<str>,
    pub factor: f64,
}

impl Contraction {
    pub fn new(pattern: impl Into<Arc<str>>, factor: f64) -> Self {
        let pattern = pattern.into();
        Self { pattern, factor }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("malformed contraction pattern {0:?}")]
    Syntax(String),
    #[error("{0} operand has {1} indices but rank {2}")]
    Rank(Role, usize, usize),
}

/// Index plan produced by a [`Planner`]. Opaque to this crate beyond the operand ranks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub ranks: [usize; MAX_TENSOR_OPERANDS],
    pub indices: [Vec<String>; MAX_TENSOR_OPERANDS],
}

impl Plan {
    /// Index record of one operand. For each of its dimensions, the 1-based position of the
    /// same index in the first other operand (positive) or the second one (negative), else `0`.
    /// The other operands are the destination then the other input for `L` and `R`, and the
    /// left then the right input for `D`.
    pub fn multi_index(&self, role: Role) -> MultiIndex {
        let [d, l, r] = &self.indices;
        let (own, first, second) = match role {
            Role::Destination => (d, l, r),
            Role::Left => (l, d, r),
            Role::Right => (r, d, l),
        };
        let find = |list: &[String], name: &str| {
            list.iter()
                .position(|x| x == name)
                .map(|x| x as i32 + 1)
        };
        let mut digits = [0; MAX_TENSOR_RANK];
        for (digit, name) in digits.iter_mut().zip(own) {
            *digit = find(first, name)
                .or_else(|| find(second, name).map(|x| -x))
                .unwrap_or(0);
        }
        MultiIndex(digits)
    }
}

/// Index record handed to kernels through pinned host memory. Dimensions past the rank are zero.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct MultiIndex(pub [i32; MAX_TENSOR_RANK]);

impl MultiIndex {
    #[inline]
    pub fn digits(&self, rank: usize) -> &[i32] {
        &self.0[..rank.min(MAX_TENSOR_RANK)]
    }
}

/// Turns a contraction pattern into an index plan. Real permutation planning is provided
/// by the numeric layer; validation here is a precondition to scheduling.
pub trait Planner: Send + Sync + std::fmt::Debug {
    fn plan(&self, pattern: &str, ranks: [usize; MAX_TENSOR_OPERANDS]) -> Result<Plan, PlanError>;
}

/// Accepts `D(..)+=L(..)*R(..)` and checks that each operand lists as many indices as its rank.
#[derive(Debug, Default, Clone, Copy)]
pub struct IndexCount;

impl IndexCount {
    fn operand(text: &str, name: char) -> Option<Vec<&str>> {
        let text = text.trim().strip_prefix(name)?.trim_start();
        let text = text.strip_prefix('(')?.strip_suffix(')')?;
        match text.trim() {
            "" => Some(vec![]),
            text => text.split(',').map(str::trim).map(Some).collect(),
        }
    }
}

impl Planner for IndexCount {
    fn plan(&self, pattern: &str, ranks: [usize; MAX_TENSOR_OPERANDS]) -> Result<Plan, PlanError> {
        let syntax = || PlanError::Syntax(pattern.into());
        let (d, rhs) = pattern.split_once("+=").ok_or_else(syntax)?;
        let (l, r) = rhs.split_once('*').ok_or_else(syntax)?;

        let operands = [(d, 'D'), (l, 'L'), (r, 'R')];
        let mut indices: [Vec<String>; MAX_TENSOR_OPERANDS] = Default::default();
        for ((text, name), role) in operands.into_iter().zip(Role::ALL) {
            let list = Self::operand(text, name).ok_or_else(syntax)?;
            if list.iter().any(|x| x.is_empty() || !x.chars().all(char::is_alphanumeric)) {
                return Err(syntax());
            }
            let rank = ranks[role as usize];
            if list.len() != rank {
                return Err(PlanError::Rank(role, list.len(), rank));
            }
            indices[role as usize] = list.into_iter().map(String::from).collect();
        }
        Ok(Plan { ranks, indices })
    }
}

/// How one operand reaches the execution device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Staging {
    pub role: Role,
    pub shape: Shape,
    pub bytes: usize,
    /// Where the kernel finds the operand.
    pub target: Location,
    /// Where the operand is copied from before execution, if it is not already resident.
    pub source: Option<Location>,
    /// The operand's [`MultiIndex`] record.
    pub index: SlabEntry,
}

/// Everything a runtime needs to run one contraction.
#[derive(Debug, Clone)]
pub struct Launch {
    pub contraction: Contraction,
    pub kind: DataKind,
    pub plan: Plan,
    pub operands: Bounded<Staging, MAX_TENSOR_OPERANDS>,
    /// Copy of the result back to its source device after execution.
    pub writeback: Option<Transfer>,
    /// Constant-argument slot holding the pattern, on devices that cache it.
    pub constant: Option<usize>,
}

impl Launch {
    pub fn operand(&self, role: Role) -> Option<&Staging> {
        self.operands.iter().find(|x| x.role == role)
    }
}

#[cfg(test)]
mod tests {
    use super::{CopyControl, CopyControlError, CopyMode, IndexCount, PlanError, Planner, Role};

    #[test]
    fn test_multi_index() {
        let plan = IndexCount.plan("D(a,b)+=L(a,c)*R(c,b)", [2, 2, 2]).unwrap();
        assert_eq!(plan.multi_index(Role::Destination).digits(2), &[1, -2]);
        assert_eq!(plan.multi_index(Role::Left).digits(2), &[1, -1]);
        assert_eq!(plan.multi_index(Role::Right).digits(2), &[-2, 2]);
        // a trace index appears nowhere else
        let plan = IndexCount.plan("D(a)+=L(a,t,t)*R()", [1, 3, 0]).unwrap();
        assert_eq!(plan.multi_index(Role::Left).digits(3), &[1, 0, 0]);
        assert_eq!(plan.multi_index(Role::Left).0[3..], [0; 29]);
    }


    #[test]
    fn test_copy_control_codes() {
        let control: CopyControl = "MTT".parse().unwrap();
        assert_eq!(control.to_string(), "MDD");
        assert_eq!(control.get(Role::Destination), CopyMode::Move);
        assert_eq!(control.get(Role::Left), CopyMode::Discard);
        assert_eq!("TTT".parse::<CopyControl>().unwrap(), CopyControl::DISCARD_ALL);
        assert_eq!("ddd".parse::<CopyControl>().unwrap(), CopyControl::DISCARD_ALL);
        assert_eq!("MKK".parse::<CopyControl>().unwrap(), CopyControl::MOVE_DESTINATION);
        assert_eq!(
            "MT".parse::<CopyControl>(),
            Err(CopyControlError::Length("MT".into()))
        );
        assert_eq!(
            "MXT".parse::<CopyControl>(),
            Err(CopyControlError::Letter('X'))
        );
    }

    #[test]
    fn test_index_count() {
        let plan = IndexCount
            .plan("D(a,b)+=L(c,d)*R(d,a,b,c)", [2, 2, 4])
            .unwrap();
        assert_eq!(plan.indices[2], vec!["d", "a", "b", "c"]);

        let plan = IndexCount.plan("D()+=L(a)*R(a)", [0, 1, 1]).unwrap();
        assert!(plan.indices[0].is_empty());
        assert_eq!(plan.multi_index(Role::Left).digits(1), &[-1]);

        assert_eq!(
            IndexCount.plan("D(a,b)+=L(c,d)*R(d,a,b,c)", [2, 3, 4]),
            Err(PlanError::Rank(Role::Left, 2, 3))
        );
        assert!(matches!(
            IndexCount.plan("D(a,b)=L(c,d)*R(d,a,b,c)", [2, 2, 4]),
            Err(PlanError::Syntax(_))
        ));
        assert!(matches!(
            IndexCount.plan("D(a,,b)+=L(c,d)*R(d,a,b,c)", [2, 2, 4]),
            Err(PlanError::Syntax(_))
        ));
    }
}
