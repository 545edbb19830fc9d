use serde::{Deserialize, Serialize};

use crate::block::BlockKind;
use crate::bus::{Bus, MapError};

/// Serialized state of one block. `data` is present for the kinds whose
/// contents cannot be reconstructed from images (RAM and video).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockState {
    pub addr: u32,
    pub kind: BlockKind,
    pub dirty: bool,
    pub data: Option<Vec<u8>>,
}

/// Serialized bus contents, enough to resume without re-running the machine's
/// bring-up writes. ROM blocks are assumed to be re-mapped from their source
/// images before [`Bus::restore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusState {
    pub block_size: u32,
    pub blocks: Vec<BlockState>,
}

impl Bus {
    pub fn save(&self) -> BusState {
        let blocks = self
            .blocks
            .iter()
            .map(|b| BlockState {
                addr: b.addr(),
                kind: b.kind(),
                dirty: b.is_dirty(),
                data: match b.kind() {
                    BlockKind::Ram | BlockKind::Video => Some(b.bytes().to_vec()),
                    BlockKind::None | BlockKind::Rom => None,
                },
            })
            .collect();
        BusState {
            block_size: self.block_size(),
            blocks,
        }
    }

    /// Restores RAM/video contents from `state`. The bus must already be
    /// populated with the same geometry (same block size, same kinds at the
    /// same addresses).
    pub fn restore(&mut self, state: &BusState) -> Result<(), MapError> {
        if state.block_size != self.block_size() {
            return Err(MapError::Snapshot("block size differs"));
        }
        if state.blocks.len() != self.blocks.len() {
            return Err(MapError::Snapshot("block count differs"));
        }
        for (block, saved) in self.blocks.iter().zip(&state.blocks) {
            if block.kind() != saved.kind {
                return Err(MapError::Snapshot("block kind differs"));
            }
        }

        for (block, saved) in self.blocks.iter_mut().zip(&state.blocks) {
            if let Some(data) = &saved.data {
                for (i, &byte) in data.iter().enumerate().take(block.size() as usize) {
                    block.load_byte(i as u32, byte);
                }
                if saved.dirty {
                    block.set_dirty();
                } else {
                    block.clean();
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{BlockKind, Bus, BusConfig};

    #[test]
    fn save_restore_round_trips_ram() {
        let mut bus = Bus::new(BusConfig::default()).unwrap();
        bus.add_blocks(0x2000, 2048, BlockKind::Ram).unwrap();
        bus.write_data(0x2100, 0x5A);
        let state = bus.save();

        let mut other = Bus::new(BusConfig::default()).unwrap();
        other.add_blocks(0x2000, 2048, BlockKind::Ram).unwrap();
        other.restore(&state).unwrap();
        assert_eq!(other.read_data(0x2100), 0x5A);
        // The dirty flag survives the round trip too.
        assert!(!other.clean_blocks(0x2000, 2048));

        // A snapshot taken after cleaning restores clean.
        bus.clean_blocks(0x2000, 2048);
        let state = bus.save();
        other.restore(&state).unwrap();
        assert!(other.clean_blocks(0x2000, 2048));
    }

    #[test]
    fn restore_rejects_mismatched_layout() {
        let mut bus = Bus::new(BusConfig::default()).unwrap();
        bus.add_blocks(0x2000, 1024, BlockKind::Ram).unwrap();
        let state = bus.save();

        let mut other = Bus::new(BusConfig::default()).unwrap();
        other.add_blocks(0x2000, 1024, BlockKind::Rom).unwrap();
        assert!(other.restore(&state).is_err());
    }
}
