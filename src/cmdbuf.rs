//! Command Buffer Module
//!
//! Dword-stream assembler for engine commands. Graphics addresses are not
//! known at build time, so every command that references a resource records
//! a patch (dword location + resource + offset) for the KMD to resolve at
//! submission, and end-of-frame tag writebacks are recorded for the engine
//! to perform on completion.

use crate::error::{HalError, Result};
use crate::mos::ResourceHandle;

/// Patch-list entry: the dword at `location` must be rewritten with the
/// graphics address of `resource` plus `offset`.
#[derive(Debug, Clone, Copy)]
pub struct GfxAddressPatch {
    pub location: usize,
    pub resource: ResourceHandle,
    pub offset: u32,
}

/// Completion-tag writeback the engine performs after the batch retires.
#[derive(Debug, Clone, Copy)]
pub struct TagWrite {
    pub resource: ResourceHandle,
    pub offset: u32,
    pub value: u32,
}

/// Fixed-capacity command stream for one frame.
pub struct CommandBuffer {
    dwords: Vec<u32>,
    capacity: usize,
    patches: Vec<GfxAddressPatch>,
    tag_writes: Vec<TagWrite>,
}

impl CommandBuffer {
    pub fn new(capacity_dwords: usize) -> Self {
        Self {
            dwords: Vec::with_capacity(capacity_dwords),
            capacity: capacity_dwords,
            patches: Vec::new(),
            tag_writes: Vec::new(),
        }
    }

    /// Append a command header plus payload. Returns the index of the
    /// header dword so that payload dwords can be patched relative to it.
    pub fn add_command(&mut self, opcode: u32, payload: &[u32]) -> Result<usize> {
        let needed = 1 + payload.len();
        let available = self.capacity - self.dwords.len();
        if needed > available {
            return Err(HalError::CommandBufferFull { needed, available });
        }

        let start = self.dwords.len();
        self.dwords.push(command_header(opcode, payload.len() as u32));
        self.dwords.extend_from_slice(payload);
        Ok(start)
    }

    /// Record a graphics-address patch for the dword at `base + dword`.
    /// The location must already hold a written dword; a patch aimed past
    /// the stream would otherwise surface only at KMD resolution time.
    pub fn patch_gfx_address(
        &mut self,
        base: usize,
        dword: usize,
        resource: ResourceHandle,
        offset: u32,
    ) -> Result<()> {
        let location = base + dword;
        if location >= self.dwords.len() {
            return Err(HalError::InvalidParameter("patch location beyond command stream"));
        }
        self.patches.push(GfxAddressPatch {
            location,
            resource,
            offset,
        });
        Ok(())
    }

    /// Record the completion-tag writeback for this batch.
    pub fn add_tag_write(&mut self, resource: ResourceHandle, offset: u32, value: u32) {
        self.tag_writes.push(TagWrite {
            resource,
            offset,
            value,
        });
    }

    pub fn dwords(&self) -> &[u32] {
        &self.dwords
    }

    pub fn patches(&self) -> &[GfxAddressPatch] {
        &self.patches
    }

    pub fn tag_writes(&self) -> &[TagWrite] {
        &self.tag_writes
    }

    pub fn remaining_dwords(&self) -> usize {
        self.capacity - self.dwords.len()
    }

    /// Reset for reuse on the next frame.
    pub fn clear(&mut self) {
        self.dwords.clear();
        self.patches.clear();
        self.tag_writes.clear();
    }
}

/// Header dword: opcode in the high half, payload dword count in the low.
const fn command_header(opcode: u32, payload_dwords: u32) -> u32 {
    (opcode << 16) | (payload_dwords & 0xFFFF)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mos::{AllocParams, OsInterface, SoftOs};
    use crate::state::CMD_VEBOX_STATE;

    fn handle() -> ResourceHandle {
        let os = SoftOs::new(true, false);
        os.allocate_resource(&AllocParams {
            name: "t",
            bytes: 64,
            lockable: true,
        })
        .unwrap()
    }

    #[test]
    fn header_encodes_opcode_and_length() {
        let mut cmd = CommandBuffer::new(8);
        let base = cmd.add_command(CMD_VEBOX_STATE, &[1, 2, 3]).unwrap();
        assert_eq!(base, 0);
        assert_eq!(cmd.dwords()[0], (CMD_VEBOX_STATE << 16) | 3);
        assert_eq!(&cmd.dwords()[1..], &[1, 2, 3]);
    }

    #[test]
    fn overflow_is_reported_not_truncated() {
        let mut cmd = CommandBuffer::new(3);
        cmd.add_command(CMD_VEBOX_STATE, &[0]).unwrap();
        let err = cmd.add_command(CMD_VEBOX_STATE, &[0, 0]).unwrap_err();
        match err {
            HalError::CommandBufferFull { needed, available } => {
                assert_eq!(needed, 3);
                assert_eq!(available, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
        // Nothing partial was written.
        assert_eq!(cmd.dwords().len(), 2);
    }

    #[test]
    fn patches_record_absolute_locations() {
        let res = handle();
        let mut cmd = CommandBuffer::new(16);
        let base = cmd.add_command(CMD_VEBOX_STATE, &[0; 6]).unwrap();
        cmd.patch_gfx_address(base, 2, res, 0x40).unwrap();
        cmd.patch_gfx_address(base, 4, res, 0x80).unwrap();
        assert_eq!(cmd.patches().len(), 2);
        assert_eq!(cmd.patches()[0].location, 2);
        assert_eq!(cmd.patches()[1].location, 4);
        assert_eq!(cmd.patches()[1].offset, 0x80);
    }

    #[test]
    fn patch_past_the_stream_is_rejected() {
        let res = handle();
        let mut cmd = CommandBuffer::new(8);
        let base = cmd.add_command(CMD_VEBOX_STATE, &[0; 2]).unwrap();
        // Stream holds dwords 0..=2; dword 3 of this command was never written.
        assert!(matches!(
            cmd.patch_gfx_address(base, 3, res, 0),
            Err(HalError::InvalidParameter(_))
        ));
        assert!(cmd.patches().is_empty());

        // Last written dword is still patchable.
        cmd.patch_gfx_address(base, 2, res, 0).unwrap();
        assert_eq!(cmd.patches().len(), 1);
    }

    #[test]
    fn clear_resets_everything() {
        let res = handle();
        let mut cmd = CommandBuffer::new(16);
        cmd.add_command(CMD_VEBOX_STATE, &[0]).unwrap();
        cmd.add_tag_write(res, 0, 7);
        cmd.clear();
        assert!(cmd.dwords().is_empty());
        assert!(cmd.patches().is_empty());
        assert!(cmd.tag_writes().is_empty());
        assert_eq!(cmd.remaining_dwords(), 16);
    }
}
