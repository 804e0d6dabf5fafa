//! Stream positions.
//!
//! A position identifies a point in an event stream. Positions are opaque to
//! the subscription engine: it only compares them. The nullable form,
//! `Option<P>`, uses `None` for "before the first event", which orders lower
//! than every concrete position.

use std::fmt::Debug;

/// A totally ordered point in an event stream.
///
/// Ordering must agree with the order in which the external stream delivers
/// events. Implemented for every type that satisfies the bounds.
pub trait Position: Ord + Clone + Debug + Send + Sync + 'static {}

impl<T> Position for T where T: Ord + Clone + Debug + Send + Sync + 'static {}

/// Returns the lowest resume position of `positions`.
///
/// `None` entries mean "from the beginning" and win over any concrete
/// position. An empty iterator also resolves to `None`.
pub fn min_position<'a, P, I>(positions: I) -> Option<P>
where
    P: Position,
    I: IntoIterator<Item = &'a Option<P>>,
{
    let mut positions = positions.into_iter();
    let mut min = positions.next()?.as_ref()?;

    for position in positions {
        let position = position.as_ref()?;

        if position < min {
            min = position;
        }
    }

    Some(min.clone())
}

/// Returns whether `position` comes strictly after `start`.
///
/// Every position is after an absent start.
pub fn is_after<P: Position>(position: &P, start: Option<&P>) -> bool {
    match start {
        Some(start) => position > start,
        None => true,
    }
}
