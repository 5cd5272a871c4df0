//! Used/unused boundary search over an ordered address list.
//!
//! [`DiscoveryStrategy::Linear`] is the ground truth: scan backward to the
//! last address with history; it and everything before it are used.
//!
//! [`DiscoveryStrategy::Binary`] splits at the midpoint and searches the
//! right half first. Any activity on the right marks the whole left half
//! and the midpoint used without querying them. If the right half is
//! quiet but the midpoint is active, the entire range is marked used.
//! Otherwise the left half is searched and the midpoint and right half stay
//! unused. This over-reports "used" when activity is not a single
//! contiguous block ending at the last active address, and agrees with the
//! linear scan whenever the final address is active or nothing is.
//!
//! Lookups run one at a time, in a fixed order.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;

use crate::error::CoreError;
use crate::provider::AddressActivity;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DiscoveryStrategy {
    Linear,
    #[default]
    Binary,
}

/// Partition of the input addresses, each side in input order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Discovery {
    pub used: Vec<String>,
    pub unused: Vec<String>,
}

impl Discovery {
    fn from_marks(addresses: &[&str], used: &[bool]) -> Self {
        let mut discovery = Self::default();
        for (address, is_used) in addresses.iter().zip(used) {
            if *is_used {
                discovery.used.push((*address).to_owned());
            } else {
                discovery.unused.push((*address).to_owned());
            }
        }
        discovery
    }
}

pub async fn discover(
    strategy: DiscoveryStrategy,
    addresses: &[&str],
    activity: &dyn AddressActivity,
) -> Result<Discovery, CoreError> {
    let mut used = vec![false; addresses.len()];
    match strategy {
        DiscoveryStrategy::Linear => linear(addresses, activity, &mut used).await?,
        DiscoveryStrategy::Binary => {
            binary(addresses, activity, 0, addresses.len(), &mut used).await?;
        }
    }

    let discovery = Discovery::from_marks(addresses, &used);
    tracing::debug!(
        ?strategy,
        total = addresses.len(),
        used = discovery.used.len(),
        unused = discovery.unused.len(),
        "address discovery finished"
    );
    Ok(discovery)
}

async fn linear(
    addresses: &[&str],
    activity: &dyn AddressActivity,
    used: &mut [bool],
) -> Result<(), CoreError> {
    for index in (0..addresses.len()).rev() {
        if activity.has_activity(addresses[index]).await? {
            used[..=index].fill(true);
            break;
        }
    }
    Ok(())
}

/// Classify `addresses[lo..hi]`, returning whether any of it is used.
fn binary<'a>(
    addresses: &'a [&'a str],
    activity: &'a dyn AddressActivity,
    lo: usize,
    hi: usize,
    used: &'a mut [bool],
) -> BoxFuture<'a, Result<bool, CoreError>> {
    async move {
        if lo >= hi {
            return Ok(false);
        }
        let mid = lo + (hi - lo) / 2;

        if binary(addresses, activity, mid + 1, hi, &mut *used).await? {
            used[lo..=mid].fill(true);
            return Ok(true);
        }
        if activity.has_activity(addresses[mid]).await? {
            used[lo..hi].fill(true);
            return Ok(true);
        }
        binary(addresses, activity, lo, mid, &mut *used).await
    }
    .boxed()
}
