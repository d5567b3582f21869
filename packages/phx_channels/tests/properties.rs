use std::time::Duration;

use phx_channels::Backoff;
use phx_channels::endpoint::{Origin, expand_endpoint, poll_endpoint};
use proptest::prelude::*;

// --- Backoff ---

proptest! {
    #[test]
    fn stepped_backoff_holds_the_last_step(
        steps in prop::collection::vec(1u64..100_000, 1..6),
        tries in 1u32..50,
    ) {
        let backoff = Backoff::stepped(&steps);
        let idx = (tries as usize).min(steps.len()) - 1;
        prop_assert_eq!(backoff.delay(tries), Duration::from_millis(steps[idx]));
    }

    #[test]
    fn stepped_backoff_never_shrinks_for_sorted_steps(
        mut steps in prop::collection::vec(1u64..100_000, 1..6),
        tries in 1u32..50,
    ) {
        steps.sort_unstable();
        let backoff = Backoff::stepped(&steps);
        prop_assert!(backoff.delay(tries) <= backoff.delay(tries + 1));
    }
}

// --- Endpoints ---

proptest! {
    #[test]
    fn absolute_endpoints_are_untouched(path in "[a-z]{1,12}", host in "[a-z]{1,12}\\.com") {
        let endpoint = format!("ws://{host}/{path}");
        prop_assert_eq!(expand_endpoint(&endpoint, None).unwrap(), endpoint);
    }

    #[test]
    fn relative_endpoints_keep_host_and_path(
        path in "/[a-z]{1,12}",
        host in "[a-z]{1,12}(:[0-9]{2,4})?",
        secure in any::<bool>(),
    ) {
        let origin = Origin::new(host.clone(), secure);
        let url = expand_endpoint(&path, Some(&origin)).unwrap();
        let scheme = if secure { "wss" } else { "ws" };
        prop_assert_eq!(url, format!("{scheme}://{host}{path}"));
    }

    #[test]
    fn poll_endpoint_is_http_and_ends_in_poll(
        secure in any::<bool>(),
        path in "[a-z]{1,12}/?",
    ) {
        let scheme = if secure { "wss" } else { "ws" };
        let url = poll_endpoint(&format!("{scheme}://localhost:4000/{path}"));
        let expected_scheme = if secure { "https://" } else { "http://" };
        prop_assert!(url.starts_with(expected_scheme));
        prop_assert!(url.ends_with("/poll"));
        prop_assert!(!url.contains("//poll"));
    }
}
