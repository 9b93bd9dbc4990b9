//! Address mapping between the two families.
//!
//! Four interchangeable strategies (NAT64, CLAT, SIIT, External) map a
//! (src, dst) pair from one family into the other. Main packets and the
//! inner packets quoted by ICMP errors go through separate operations: the
//! inner variants skip the usable-address filtering so that error messages
//! about odd senders still make it through for debugging.

use crate::config::{Addressing, Config, EndpointPair};
use crate::worker::WorkerContext;
use crate::{external, ip};
use anyhow::Result;
use std::net::{Ipv4Addr, Ipv6Addr};

/// What the mapper decided about a packet's address pair.
pub(crate) enum MapOutcome<T> {
    Mapped(T),
    /// Not translatable; the packet is silently discarded.
    Drop,
    /// The external mapper explicitly refused the destination; the internal
    /// router owes the sender an unreachable error.
    Unreachable,
}

impl<T> MapOutcome<T> {
    fn from_pair(src: Option<T>, dst: Option<T>) -> MapOutcome<(T, T)> {
        match (src, dst) {
            (Some(src), Some(dst)) => MapOutcome::Mapped((src, dst)),
            _ => MapOutcome::Drop,
        }
    }
}

pub(crate) fn map_main_4to6(
    ctx: &mut WorkerContext,
    src: Ipv4Addr,
    dst: Ipv4Addr,
) -> Result<MapOutcome<(Ipv6Addr, Ipv6Addr)>> {
    let config = ctx.config.clone();

    Ok(match &config.addressing {
        Addressing::Siit { prefix, allow_private } => MapOutcome::from_pair(
            embed_main(&config, *prefix, *allow_private, src),
            embed_main(&config, *prefix, *allow_private, dst),
        ),
        Addressing::Nat64 { endpoint, prefix, allow_private } => MapOutcome::from_pair(
            endpoint_embed_main(&config, *endpoint, *prefix, *allow_private, src),
            endpoint_4to6(*endpoint, dst),
        ),
        Addressing::Clat { endpoint, prefix, allow_private } => MapOutcome::from_pair(
            endpoint_4to6(*endpoint, src),
            endpoint_embed_main(&config, *endpoint, *prefix, *allow_private, dst),
        ),
        Addressing::External(external_config) => {
            let state = ctx
                .external
                .as_mut()
                .ok_or(crate::InvariantViolation("external mapper state missing"))?;

            external::map_main_4to6(state, &config, external_config, src, dst)?
        }
    })
}

pub(crate) fn map_inner_4to6(
    ctx: &mut WorkerContext,
    src: Ipv4Addr,
    dst: Ipv4Addr,
) -> Result<MapOutcome<(Ipv6Addr, Ipv6Addr)>> {
    let config = ctx.config.clone();

    Ok(match &config.addressing {
        Addressing::Siit { prefix, .. }
        | Addressing::Nat64 { prefix, .. }
        | Addressing::Clat { prefix, .. } => {
            MapOutcome::Mapped((embed(*prefix, src), embed(*prefix, dst)))
        }
        Addressing::External(external_config) => {
            let state = ctx
                .external
                .as_mut()
                .ok_or(crate::InvariantViolation("external mapper state missing"))?;

            external::map_inner_4to6(state, &config, external_config, src, dst)?
        }
    })
}

pub(crate) fn map_main_6to4(
    ctx: &mut WorkerContext,
    src: Ipv6Addr,
    dst: Ipv6Addr,
) -> Result<MapOutcome<(Ipv4Addr, Ipv4Addr)>> {
    let config = ctx.config.clone();

    Ok(match &config.addressing {
        Addressing::Siit { prefix, allow_private } => MapOutcome::from_pair(
            extract_main(&config, *prefix, *allow_private, src),
            extract_main(&config, *prefix, *allow_private, dst),
        ),
        Addressing::Nat64 { endpoint, prefix, allow_private } => MapOutcome::from_pair(
            endpoint_6to4(*endpoint, src),
            endpoint_extract_main(&config, *endpoint, *prefix, *allow_private, dst),
        ),
        Addressing::Clat { endpoint, prefix, allow_private } => MapOutcome::from_pair(
            endpoint_extract_main(&config, *endpoint, *prefix, *allow_private, src),
            endpoint_6to4(*endpoint, dst),
        ),
        Addressing::External(external_config) => {
            let state = ctx
                .external
                .as_mut()
                .ok_or(crate::InvariantViolation("external mapper state missing"))?;

            external::map_main_6to4(state, &config, external_config, src, dst)?
        }
    })
}

pub(crate) fn map_inner_6to4(
    ctx: &mut WorkerContext,
    src: Ipv6Addr,
    dst: Ipv6Addr,
) -> Result<MapOutcome<(Ipv4Addr, Ipv4Addr)>> {
    let config = ctx.config.clone();

    Ok(match &config.addressing {
        Addressing::Siit { prefix, .. }
        | Addressing::Nat64 { prefix, .. }
        | Addressing::Clat { prefix, .. } => {
            MapOutcome::from_pair(extract_inner(*prefix, src), extract_inner(*prefix, dst))
        }
        Addressing::External(external_config) => {
            let state = ctx
                .external
                .as_mut()
                .ok_or(crate::InvariantViolation("external mapper state missing"))?;

            external::map_inner_6to4(state, &config, external_config, src, dst)?
        }
    })
}

/// An IPv4 address may be embedded into the prefix iff it is not the
/// router's and not unusable (nor private, unless configured otherwise).
fn is_embeddable(config: &Config, allow_private: bool, addr: Ipv4Addr) -> bool {
    if addr == config.router_ipv4 {
        return false;
    }

    if allow_private {
        !ip::is_ipv4_unusable(addr)
    } else {
        !ip::is_ipv4_unusable_or_private(addr)
    }
}

fn embed(prefix: Ipv6Addr, addr: Ipv4Addr) -> Ipv6Addr {
    let mut octets = prefix.octets();
    octets[12..].copy_from_slice(&addr.octets());

    Ipv6Addr::from(octets)
}

fn matches_prefix(prefix: Ipv6Addr, addr: Ipv6Addr) -> bool {
    addr.octets()[..12] == prefix.octets()[..12]
}

fn extract(addr: Ipv6Addr) -> Ipv4Addr {
    let octets = addr.octets();

    Ipv4Addr::new(octets[12], octets[13], octets[14], octets[15])
}

fn embed_main(
    config: &Config,
    prefix: Ipv6Addr,
    allow_private: bool,
    addr: Ipv4Addr,
) -> Option<Ipv6Addr> {
    if !is_embeddable(config, allow_private, addr) {
        return None;
    }

    let mapped = embed(prefix, addr);
    (mapped != config.router_ipv6).then_some(mapped)
}

fn extract_main(
    config: &Config,
    prefix: Ipv6Addr,
    allow_private: bool,
    addr: Ipv6Addr,
) -> Option<Ipv4Addr> {
    if addr == config.router_ipv6 || !matches_prefix(prefix, addr) {
        return None;
    }

    let mapped = extract(addr);
    is_embeddable(config, allow_private, mapped).then_some(mapped)
}

fn extract_inner(prefix: Ipv6Addr, addr: Ipv6Addr) -> Option<Ipv4Addr> {
    matches_prefix(prefix, addr).then(|| extract(addr))
}

/// The prefix path of NAT64/CLAT: like SIIT, but the translator's own
/// addresses are reserved for the endpoint substitution.
fn endpoint_embed_main(
    config: &Config,
    endpoint: EndpointPair,
    prefix: Ipv6Addr,
    allow_private: bool,
    addr: Ipv4Addr,
) -> Option<Ipv6Addr> {
    if addr == endpoint.ipv4 {
        return None;
    }

    let mapped = embed_main(config, prefix, allow_private, addr)?;
    (mapped != endpoint.ipv6).then_some(mapped)
}

fn endpoint_extract_main(
    config: &Config,
    endpoint: EndpointPair,
    prefix: Ipv6Addr,
    allow_private: bool,
    addr: Ipv6Addr,
) -> Option<Ipv4Addr> {
    if addr == endpoint.ipv6 {
        return None;
    }

    let mapped = extract_main(config, prefix, allow_private, addr)?;
    (mapped != endpoint.ipv4).then_some(mapped)
}

fn endpoint_4to6(endpoint: EndpointPair, addr: Ipv4Addr) -> Option<Ipv6Addr> {
    (addr == endpoint.ipv4).then_some(endpoint.ipv6)
}

fn endpoint_6to4(endpoint: EndpointPair, addr: Ipv6Addr) -> Option<Ipv4Addr> {
    (addr == endpoint.ipv6).then_some(endpoint.ipv4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Addressing, Config, EndpointPair};
    use proptest::prelude::*;
    use std::sync::Arc;

    fn config(addressing: Addressing) -> Arc<Config> {
        Arc::new(Config {
            addressing,
            router_ipv4: Ipv4Addr::new(192, 0, 2, 1),
            router_ipv6: "2001:db8::1".parse().unwrap(),
            generated_packet_ttl: 64,
            ipv4_outbound_mtu: 1500,
            ipv6_outbound_mtu: 1500,
            copy_dscp_ecn_4to6: true,
            copy_dscp_ecn_6to4: true,
            workers: 1,
        })
    }

    fn prefix() -> Ipv6Addr {
        "64:ff9b::".parse().unwrap()
    }

    fn siit_ctx(allow_private: bool) -> WorkerContext {
        WorkerContext::for_tests(config(Addressing::Siit { prefix: prefix(), allow_private }))
    }

    fn nat64_ctx() -> WorkerContext {
        WorkerContext::for_tests(config(Addressing::Nat64 {
            endpoint: EndpointPair {
                ipv4: Ipv4Addr::new(203, 0, 113, 9),
                ipv6: "2001:db8::2".parse().unwrap(),
            },
            prefix: prefix(),
            allow_private: false,
        }))
    }

    fn clat_ctx() -> WorkerContext {
        WorkerContext::for_tests(config(Addressing::Clat {
            endpoint: EndpointPair {
                ipv4: Ipv4Addr::new(203, 0, 113, 9),
                ipv6: "2001:db8::2".parse().unwrap(),
            },
            prefix: prefix(),
            allow_private: false,
        }))
    }

    fn mapped<T>(outcome: Result<MapOutcome<T>>) -> T {
        match outcome.unwrap() {
            MapOutcome::Mapped(pair) => pair,
            MapOutcome::Drop => panic!("pair was dropped"),
            MapOutcome::Unreachable => panic!("pair was unreachable"),
        }
    }

    fn dropped<T>(outcome: Result<MapOutcome<T>>) -> bool {
        matches!(outcome.unwrap(), MapOutcome::Drop)
    }

    #[test]
    fn siit_rejects_documentation_space_without_allow_private() {
        assert!(dropped(map_main_4to6(
            &mut siit_ctx(false),
            Ipv4Addr::new(198, 51, 100, 2),
            Ipv4Addr::new(8, 8, 8, 8),
        )));
    }

    #[test]
    fn siit_allows_documentation_space_with_allow_private() {
        let (src, dst) = mapped(map_main_4to6(
            &mut siit_ctx(true),
            Ipv4Addr::new(198, 51, 100, 2),
            Ipv4Addr::new(192, 0, 2, 33),
        ));

        assert_eq!(src, "64:ff9b::c633:6402".parse::<Ipv6Addr>().unwrap());
        assert_eq!(dst, "64:ff9b::c000:221".parse::<Ipv6Addr>().unwrap());
    }

    #[test]
    fn siit_rejects_router_addresses() {
        assert!(dropped(map_main_4to6(
            &mut siit_ctx(true),
            Ipv4Addr::new(192, 0, 2, 1), // router IPv4
            Ipv4Addr::new(8, 8, 8, 8),
        )));

        assert!(dropped(map_main_6to4(
            &mut siit_ctx(true),
            "2001:db8::1".parse().unwrap(), // router IPv6, also outside prefix
            "64:ff9b::808:808".parse().unwrap(),
        )));
    }

    #[test]
    fn siit_extracts_prefixed_pair() {
        let (src, dst) = mapped(map_main_6to4(
            &mut siit_ctx(false),
            "64:ff9b::808:808".parse().unwrap(),
            "64:ff9b::101:101".parse().unwrap(),
        ));

        assert_eq!(src, Ipv4Addr::new(8, 8, 8, 8));
        assert_eq!(dst, Ipv4Addr::new(1, 1, 1, 1));
    }

    #[test]
    fn siit_rejects_foreign_prefix() {
        assert!(dropped(map_main_6to4(
            &mut siit_ctx(false),
            "2001:db8:1::808:808".parse().unwrap(),
            "64:ff9b::101:101".parse().unwrap(),
        )));
    }

    #[test]
    fn nat64_substitutes_the_ipv6_endpoint() {
        let (src, dst) = mapped(map_main_6to4(
            &mut nat64_ctx(),
            "2001:db8::2".parse().unwrap(),
            "64:ff9b::808:808".parse().unwrap(),
        ));

        assert_eq!(src, Ipv4Addr::new(203, 0, 113, 9));
        assert_eq!(dst, Ipv4Addr::new(8, 8, 8, 8));

        let (src, dst) = mapped(map_main_4to6(
            &mut nat64_ctx(),
            Ipv4Addr::new(8, 8, 8, 8),
            Ipv4Addr::new(203, 0, 113, 9),
        ));

        assert_eq!(src, "64:ff9b::808:808".parse::<Ipv6Addr>().unwrap());
        assert_eq!(dst, "2001:db8::2".parse::<Ipv6Addr>().unwrap());
    }

    #[test]
    fn nat64_rejects_wrong_side_source() {
        // 6→4 traffic must originate from the translator's IPv6 endpoint.
        assert!(dropped(map_main_6to4(
            &mut nat64_ctx(),
            "2001:db8::beef".parse().unwrap(),
            "64:ff9b::808:808".parse().unwrap(),
        )));
    }

    #[test]
    fn clat_mirrors_nat64() {
        let (src, dst) = mapped(map_main_4to6(
            &mut clat_ctx(),
            Ipv4Addr::new(203, 0, 113, 9),
            Ipv4Addr::new(8, 8, 8, 8),
        ));

        assert_eq!(src, "2001:db8::2".parse::<Ipv6Addr>().unwrap());
        assert_eq!(dst, "64:ff9b::808:808".parse::<Ipv6Addr>().unwrap());

        let (src, dst) = mapped(map_main_6to4(
            &mut clat_ctx(),
            "64:ff9b::808:808".parse().unwrap(),
            "2001:db8::2".parse().unwrap(),
        ));

        assert_eq!(src, Ipv4Addr::new(8, 8, 8, 8));
        assert_eq!(dst, Ipv4Addr::new(203, 0, 113, 9));
    }

    #[test]
    fn inner_mapping_skips_usability_filters() {
        let (src, dst) = mapped(map_inner_4to6(
            &mut siit_ctx(false),
            Ipv4Addr::new(127, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 1),
        ));

        assert_eq!(src, "64:ff9b::7f00:1".parse::<Ipv6Addr>().unwrap());
        assert_eq!(dst, "64:ff9b::a00:1".parse::<Ipv6Addr>().unwrap());

        let (src, dst) = mapped(map_inner_6to4(
            &mut siit_ctx(false),
            "64:ff9b::7f00:1".parse().unwrap(),
            "64:ff9b::a00:1".parse().unwrap(),
        ));

        assert_eq!(src, Ipv4Addr::new(127, 0, 0, 1));
        assert_eq!(dst, Ipv4Addr::new(10, 0, 0, 1));
    }

    proptest! {
        // Mapping a usable pair into IPv6 and back must return the original
        // addresses.
        #[test]
        fn siit_round_trips(src in any::<u32>(), dst in any::<u32>()) {
            let src = Ipv4Addr::from(src);
            let dst = Ipv4Addr::from(dst);
            let mut ctx = siit_ctx(false);

            let embedded = match map_main_4to6(&mut ctx, src, dst).unwrap() {
                MapOutcome::Mapped(pair) => pair,
                _ => return Ok(()),
            };

            let (back_src, back_dst) =
                mapped(map_main_6to4(&mut ctx, embedded.0, embedded.1));
            prop_assert_eq!(back_src, src);
            prop_assert_eq!(back_dst, dst);
        }
    }
}
