//! Generated device identities

use std::collections::HashMap;

use rand::Rng;

use super::config::{FleetConfig, MAX_DEVICE_COUNT};
use crate::device::{Device, PciId};

const SERIAL_PREFIX: &str = "FK";
const UUID_TABLE_VERSION: &str = "01F0";
const UUID_FAB: &str = "99";
const UUID_LOTS: &[&str] = &["P73B93", "TNBR62", "P53B53", "TNBR72"];

/// Devices of a synthetic fleet, addressable by index and by serial
#[derive(Debug, Clone, Default)]
pub struct SimulatedFleet {
    by_index: Vec<Device>,
    by_serial: HashMap<String, usize>,
}

impl SimulatedFleet {
    /// Generate `config.device_count` devices with unique serials and
    /// consecutive bus numbers starting at a random base
    pub fn generate<R: Rng>(config: &FleetConfig, pci_id: PciId, rng: &mut R) -> Self {
        let count = config.device_count.min(MAX_DEVICE_COUNT);
        let base = rng.random_range(0..=MAX_DEVICE_COUNT - count);

        let mut fleet = Self::default();
        for i in 0..count {
            let serial = loop {
                let candidate = random_serial(rng);
                if !fleet.by_serial.contains_key(&candidate) {
                    break candidate;
                }
            };

            let device = Device {
                serial: serial.clone(),
                uuid: random_uuid(&config.hl_device, rng),
                pci_id,
                bus_id: format!("0000:{:02x}:00.0", base + i),
                minor: i,
                module_id: i,
            };

            fleet.by_serial.insert(serial, fleet.by_index.len());
            fleet.by_index.push(device);
        }

        fleet
    }

    pub fn len(&self) -> usize {
        self.by_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_index.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Device> {
        self.by_index.get(index)
    }

    pub fn by_serial(&self, serial: &str) -> Option<&Device> {
        self.by_serial.get(serial).map(|&i| &self.by_index[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.by_index.iter()
    }
}

fn random_serial<R: Rng>(rng: &mut R) -> String {
    format!("{}{:08}", SERIAL_PREFIX, rng.random_range(0..100_000_000u32))
}

/// `01F0-<device>-99-<lot>-<wafer>-<x>-<y>`
fn random_uuid<R: Rng>(hl_device: &str, rng: &mut R) -> String {
    let lot = UUID_LOTS[rng.random_range(0..UUID_LOTS.len())];
    let wafer = rng.random_range(1..=12u32);
    let x = rng.random_range(1..=28u32);
    let y = rng.random_range(0..24u32);

    format!(
        "{}-{}-{}-{}-{:02}-{:02}-{:02}",
        UUID_TABLE_VERSION, hl_device, UUID_FAB, lot, wafer, x, y
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    fn generate_fleet(count: u32, seed: u64) -> SimulatedFleet {
        let config = FleetConfig {
            device_count: count,
            ..FleetConfig::default()
        };
        let mut rng = StdRng::seed_from_u64(seed);
        SimulatedFleet::generate(&config, PciId::new(0x1da3, 0x1020), &mut rng)
    }

    #[test]
    fn test_identity_formats() {
        let fleet = generate_fleet(8, 1);
        assert_eq!(fleet.len(), 8);

        for (i, device) in fleet.iter().enumerate() {
            assert_eq!(device.serial.len(), 10);
            assert!(device.serial.starts_with("FK"));
            assert!(device.serial[2..].chars().all(|c| c.is_ascii_digit()));

            let parts: Vec<&str> = device.uuid.split('-').collect();
            assert_eq!(parts.len(), 7);
            assert_eq!(&parts[..3], &["01F0", "HL2080F0", "99"]);
            assert!(UUID_LOTS.contains(&parts[3]));

            assert!(device.bus_id.starts_with("0000:"));
            assert!(device.bus_id.ends_with(":00.0"));
            assert_eq!(device.minor, i as u32);
            assert_eq!(device.module_id, i as u32);
        }
    }

    #[test]
    fn test_bus_ids_are_consecutive_and_fit_a_byte() {
        for seed in 0..32 {
            let fleet = generate_fleet(MAX_DEVICE_COUNT, seed);
            let buses: Vec<u32> = fleet
                .iter()
                .map(|d| u32::from_str_radix(&d.bus_id[5..7], 16).unwrap())
                .collect();
            assert_eq!(buses.first(), Some(&0));
            assert_eq!(buses.last(), Some(&255));
        }

        let small = generate_fleet(4, 9);
        let buses: Vec<u32> = small
            .iter()
            .map(|d| u32::from_str_radix(&d.bus_id[5..7], 16).unwrap())
            .collect();
        assert!(buses.windows(2).all(|w| w[1] == w[0] + 1));
    }

    #[test]
    fn test_serials_are_unique_and_indexed() {
        let fleet = generate_fleet(200, 3);
        let serials: HashSet<&str> = fleet.iter().map(|d| d.serial.as_str()).collect();
        assert_eq!(serials.len(), 200);

        for (i, device) in fleet.iter().enumerate() {
            assert_eq!(fleet.by_serial(&device.serial), fleet.get(i));
        }
        assert!(fleet.by_serial("FK00000000x").is_none());
    }

    #[test]
    fn test_seed_is_deterministic() {
        let a: Vec<String> = generate_fleet(8, 42).iter().map(|d| d.uuid.clone()).collect();
        let b: Vec<String> = generate_fleet(8, 42).iter().map(|d| d.uuid.clone()).collect();
        assert_eq!(a, b);
    }
}
