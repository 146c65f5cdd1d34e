#![forbid(unsafe_code)]

use ecutune_kernel_contracts::calibration::{CalibrationMap, Profile};
use ecutune_kernel_contracts::flash::{FlashBlock, FlashImage};
use ecutune_kernel_contracts::{ContractViolation, Validate};
use sha2::{Digest, Sha256};

/// Each cell is stored as one little-endian u16 of raw ROM units.
pub const BYTES_PER_CELL: usize = 2;

pub fn encode_map(map: &CalibrationMap) -> Result<Vec<u8>, ContractViolation> {
    let mut out = Vec::with_capacity(map.cell_count() * BYTES_PER_CELL);
    for value in map.grid.cells() {
        let raw = (value * map.conversion_factor).round();
        if !(0.0..=f64::from(u16::MAX)).contains(&raw) {
            return Err(ContractViolation::InvalidRange {
                field: "flash_block.payload",
                min: 0.0,
                max: f64::from(u16::MAX),
                got: raw,
            });
        }
        // Range checked above.
        out.extend_from_slice(&(raw as u16).to_le_bytes());
    }
    Ok(out)
}

/// Lower-hex SHA-256 over `address || size || payload` of every block in order.
pub fn checksum_blocks(blocks: &[FlashBlock]) -> String {
    let mut hasher = Sha256::new();
    for block in blocks {
        hasher.update(block.address.to_le_bytes());
        hasher.update(block.size.to_le_bytes());
        hasher.update(&block.payload);
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// One block per map, ordered by ROM address, checksum recorded at assembly.
pub fn assemble_image(profile: &Profile) -> Result<FlashImage, ContractViolation> {
    let mut maps: Vec<&CalibrationMap> = profile.maps.iter().collect();
    maps.sort_by_key(|m| m.rom_address);
    let mut blocks = Vec::with_capacity(maps.len());
    for map in maps {
        let payload = encode_map(map)?;
        let size = u32::try_from(payload.len()).map_err(|_| ContractViolation::InvalidValue {
            field: "flash_block.size",
            reason: "block exceeds u32 size",
        })?;
        blocks.push(FlashBlock {
            map_id: map.id.clone(),
            address: map.rom_address,
            size,
            payload,
        });
    }
    let checksum = checksum_blocks(&blocks);
    Ok(FlashImage {
        profile_id: profile.id.clone(),
        blocks,
        checksum,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInspection {
    pub checksum_ok: bool,
    pub structure_ok: bool,
    pub issues: Vec<String>,
}

/// Recomputes the checksum and re-runs the layout checks without writing anything.
pub fn inspect_image(image: &FlashImage) -> ImageInspection {
    let mut issues = Vec::new();
    let recomputed = checksum_blocks(&image.blocks);
    let checksum_ok = recomputed == image.checksum;
    if !checksum_ok {
        issues.push(format!(
            "checksum mismatch: recorded {} recomputed {recomputed}",
            image.checksum
        ));
    }
    let structure_ok = match image.validate() {
        Ok(()) => true,
        Err(violation) => {
            issues.push(violation.to_string());
            false
        }
    };
    ImageInspection {
        checksum_ok,
        structure_ok,
        issues,
    }
}
