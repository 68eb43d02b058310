// NAT translation assignment

//! Translation assigner and model materialization
//!
//! A conflicting subnet can be exposed through a same-size replacement range.
//! Candidates are aligned blocks of 172.16.0.0/12 first, then 192.168.0.0/16;
//! the first block that overlaps neither the WAN ranges nor any subnet or
//! translation already present in the WAN wins. An existing mapping is always
//! reused so compiled configurations stay stable.

use crate::allocator;
use crate::cidr;
use crate::model::{LocalSubnet, OverlayModel};
use crate::{Error, Result};
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

/// Private ranges searched for translation blocks, in order of preference
const TRANSLATION_POOLS: [(Ipv4Addr, u8); 2] = [
    (Ipv4Addr::new(172, 16, 0, 0), 12),
    (Ipv4Addr::new(192, 168, 0, 0), 16),
];

/// Ranges a translated block must stay clear of
fn ranges_in_use(model: &OverlayModel, skip: Option<&LocalSubnet>) -> Vec<Ipv4Net> {
    let mut used = vec![model.wan.tunnel_range, model.wan.shared_range];
    for subnet in model.peers.iter().flat_map(|p| p.subnets.iter()) {
        used.push(subnet.cidr);
        if let Some(translated) = subnet.translated {
            // The subnet being (re)assigned does not block its own old mapping
            if skip.map(|s| s.id) != Some(subnet.id) {
                used.push(translated);
            }
        }
    }
    used
}

/// Pick a translation for `subnet`, reusing the mapping it already has
pub fn assign(subnet: &LocalSubnet, model: &OverlayModel) -> Result<Ipv4Net> {
    if let Some(existing) = subnet.translated {
        return Ok(existing);
    }
    let used = ranges_in_use(model, Some(subnet));
    find_free_block(subnet.cidr.prefix_len(), &used)
}

/// First aligned block of the given size clear of every range in `used`
pub fn find_free_block(prefix_len: u8, used: &[Ipv4Net]) -> Result<Ipv4Net> {
    for (base, base_len) in TRANSLATION_POOLS {
        if prefix_len < base_len {
            continue;
        }
        let pool = Ipv4Net::new(base, base_len).map_err(|e| Error::InvalidCidr(e.to_string()))?;
        let step = 1u64 << (32 - prefix_len);
        let mut start = u64::from(cidr::first(&pool));
        let end = u64::from(cidr::last(&pool));

        while start <= end {
            let candidate = Ipv4Net::new(Ipv4Addr::from(start as u32), prefix_len)
                .map_err(|e| Error::InvalidCidr(e.to_string()))?;
            if !used.iter().any(|u| cidr::overlaps(u, &candidate)) {
                log::debug!("Translation block {} is free", candidate);
                return Ok(candidate);
            }
            start += step;
        }
    }
    Err(Error::NoSpace { prefix_len })
}

/// Fill in every unset assignment of a model
///
/// Peers without a tunnel address, active services without a shared address,
/// and NAT subnets without a translation get one; existing assignments are
/// left untouched. The result is validated before it is returned.
pub fn materialize(model: &OverlayModel) -> Result<OverlayModel> {
    model.wan.validate()?;
    let mut out = model.clone();

    for i in 0..out.peers.len() {
        if out.peers[i].tunnel_address.is_none() {
            let in_use = allocator::tunnel_addresses_in_use(&out);
            let address = allocator::allocate(
                &out.wan.tunnel_range,
                &in_use,
                &Default::default(),
            )?;
            log::info!("Assigned tunnel address {} to {}", address, out.peers[i].name);
            out.peers[i].tunnel_address = Some(address);
        }
    }

    for i in 0..out.services.len() {
        if out.services[i].active && out.services[i].shared_address.is_none() {
            let in_use = allocator::shared_addresses_in_use(&out);
            let address = allocator::allocate(
                &out.wan.shared_range,
                &in_use,
                &Default::default(),
            )?;
            log::info!(
                "Assigned shared address {} to service {}",
                address,
                out.services[i].name
            );
            out.services[i].shared_address = Some(address);
        }
    }

    for p in 0..out.peers.len() {
        for s in 0..out.peers[p].subnets.len() {
            let subnet = &out.peers[p].subnets[s];
            if subnet.nat && subnet.translated.is_none() {
                let translated = assign(subnet, &out)?;
                log::info!(
                    "Translating {} of {} to {}",
                    subnet.cidr,
                    out.peers[p].name,
                    translated
                );
                out.peers[p].subnets[s].translated = Some(translated);
            }
        }
    }

    out.validate()?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::*;
    use crate::model::{DeviceType, TopologyMode};

    fn two_site_model() -> OverlayModel {
        let mut a = peer(1, "site-a", DeviceType::ManagedRouter, "10.0.0.1");
        let mut b = peer(2, "site-b", DeviceType::ManagedRouter, "10.0.0.2");
        a.subnets = vec![subnet(11, "192.168.1.0/24", true)];
        b.subnets = vec![subnet(12, "192.168.1.0/24", true)];
        OverlayModel {
            wan: wan(TopologyMode::Mesh),
            peers: vec![a, b],
            services: vec![],
        }
    }

    #[test]
    fn test_assign_prefers_172_16() {
        let model = two_site_model();
        let translated = assign(&model.peers[1].subnets[0], &model).unwrap();
        assert_eq!(translated.to_string(), "172.16.0.0/24");
    }

    #[test]
    fn test_assign_skips_blocks_in_use() {
        let mut model = two_site_model();
        model.peers[0].subnets.push(subnet(13, "172.16.0.0/23", true));
        let translated = assign(&model.peers[1].subnets[0], &model).unwrap();
        assert_eq!(translated.to_string(), "172.16.2.0/24");
    }

    #[test]
    fn test_assign_reuses_existing_mapping() {
        let mut model = two_site_model();
        model.peers[1].subnets[0].nat = true;
        model.peers[1].subnets[0].translated = Some("172.16.5.0/24".parse().unwrap());
        for _ in 0..3 {
            let translated = assign(&model.peers[1].subnets[0], &model).unwrap();
            assert_eq!(translated.to_string(), "172.16.5.0/24");
        }
    }

    #[test]
    fn test_falls_back_to_192_168() {
        let used: Vec<Ipv4Net> = vec!["172.16.0.0/12".parse().unwrap()];
        let block = find_free_block(24, &used).unwrap();
        assert_eq!(block.to_string(), "192.168.0.0/24");
    }

    #[test]
    fn test_no_space() {
        let used: Vec<Ipv4Net> = vec![
            "172.16.0.0/12".parse().unwrap(),
            "192.168.0.0/16".parse().unwrap(),
        ];
        assert!(matches!(
            find_free_block(24, &used),
            Err(Error::NoSpace { prefix_len: 24 })
        ));
        // Larger than either pool
        assert!(find_free_block(8, &[]).is_err());
    }

    #[test]
    fn test_materialize_fills_unset_only() {
        let mut model = two_site_model();
        model.peers[1].tunnel_address = None;
        model.peers[1].subnets[0].nat = true;
        let svc_a = service(21, &model.peers[0], "192.168.1.10", 80, "10.0.5.9");
        let mut svc_b = service(22, &model.peers[1], "192.168.1.20", 22, "10.0.5.1");
        svc_b.shared_address = None;
        model.services = vec![svc_a, svc_b];

        let out = materialize(&model).unwrap();
        assert_eq!(out.peers[0].tunnel_address, model.peers[0].tunnel_address);
        assert_eq!(
            out.peers[1].tunnel_address,
            Some(Ipv4Addr::new(10, 0, 0, 2))
        );
        assert_eq!(
            out.peers[1].subnets[0].translated.map(|t| t.to_string()),
            Some("172.16.0.0/24".to_string())
        );
        assert_eq!(out.services[0].shared_address, Some(Ipv4Addr::new(10, 0, 5, 9)));
        assert_eq!(out.services[1].shared_address, Some(Ipv4Addr::new(10, 0, 5, 1)));

        // Materializing again changes nothing
        assert_eq!(materialize(&out).unwrap(), out);
    }
}
