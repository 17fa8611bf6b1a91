use chanorm_accelerate_api::{AccelError, AccelResult};

/// Channels processed together by one work item.
pub const CHANNEL_BLOCK: usize = 4;

/// Launch grid for a channel-wise kernel over an NHWC (or NC) tensor.
///
/// The grid is `(channel_blocks, width, height * batch)`; `remain_channels`
/// counts the padding lanes of the last channel block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchGeometry {
    pub batch: usize,
    pub height: usize,
    pub width: usize,
    pub channels: usize,
    pub channel_blocks: usize,
    pub remain_channels: i32,
    pub global_work_size: [u32; 3],
}

impl LaunchGeometry {
    /// Rank 2 shapes are read as `(batch, channels)`, rank 4 shapes as
    /// `(batch, height, width, channels)`.
    pub fn derive(shape: &[usize]) -> AccelResult<Self> {
        let (batch, height, width, channels) = match *shape {
            [batch, channels] => (batch, 1, 1, channels),
            [batch, height, width, channels] => (batch, height, width, channels),
            _ => {
                return Err(AccelError::unsupported(format!(
                    "expected a rank 2 or rank 4 tensor, got rank {} (shape {:?})",
                    shape.len(),
                    shape
                )))
            }
        };

        // height and channels travel to the kernel as i32 arguments.
        i32_extent(height, "height")?;
        i32_extent(channels, "channels")?;

        let channel_blocks = channels.div_ceil(CHANNEL_BLOCK);
        let remain_channels = ((CHANNEL_BLOCK - channels % CHANNEL_BLOCK) % CHANNEL_BLOCK) as i32;
        let rows = height.checked_mul(batch).ok_or_else(|| {
            AccelError::unsupported(format!("height * batch overflows for shape {shape:?}"))
        })?;

        Ok(Self {
            batch,
            height,
            width,
            channels,
            channel_blocks,
            remain_channels,
            global_work_size: [
                u32_extent(channel_blocks, "channel blocks")?,
                u32_extent(width, "width")?,
                u32_extent(rows, "height * batch")?,
            ],
        })
    }

    pub fn height_arg(&self) -> i32 {
        self.height as i32
    }

    pub fn channels_arg(&self) -> i32 {
        self.channels as i32
    }

    /// `[batch, height, width, channels]`
    pub fn extents(&self) -> [usize; 4] {
        [self.batch, self.height, self.width, self.channels]
    }

    pub fn is_empty(&self) -> bool {
        self.global_work_size.iter().any(|&g| g == 0)
    }
}

fn u32_extent(value: usize, what: &str) -> AccelResult<u32> {
    u32::try_from(value)
        .map_err(|_| AccelError::unsupported(format!("{what} {value} exceeds the launch grid range")))
}

fn i32_extent(value: usize, what: &str) -> AccelResult<i32> {
    i32::try_from(value)
        .map_err(|_| AccelError::unsupported(format!("{what} {value} exceeds the kernel argument range")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank4_grid_covers_channel_blocks() {
        let geometry = LaunchGeometry::derive(&[2, 3, 4, 5]).expect("geometry");
        assert_eq!(geometry.channel_blocks, 2);
        assert_eq!(geometry.remain_channels, 3);
        assert_eq!(geometry.global_work_size, [2, 4, 6]);
        assert_eq!(geometry.extents(), [2, 3, 4, 5]);
    }

    #[test]
    fn rank2_is_read_as_unit_spatial_extent() {
        let flat = LaunchGeometry::derive(&[2, 5]).expect("geometry");
        let spatial = LaunchGeometry::derive(&[2, 1, 1, 5]).expect("geometry");
        assert_eq!(flat, spatial);
        assert_eq!(flat.global_work_size, [2, 1, 2]);
    }

    #[test]
    fn whole_blocks_have_no_padding() {
        let geometry = LaunchGeometry::derive(&[1, 8]).expect("geometry");
        assert_eq!(geometry.channel_blocks, 2);
        assert_eq!(geometry.remain_channels, 0);
    }

    #[test]
    fn other_ranks_are_unsupported() {
        for shape in [&[7usize][..], &[1, 2, 3][..], &[1, 2, 3, 4, 5][..], &[][..]] {
            match LaunchGeometry::derive(shape) {
                Err(AccelError::Unsupported(_)) => {}
                other => panic!("shape {shape:?}: expected unsupported, got {other:?}"),
            }
        }
    }

    #[test]
    fn empty_channels_give_an_empty_grid() {
        let geometry = LaunchGeometry::derive(&[3, 0]).expect("geometry");
        assert_eq!(geometry.global_work_size, [0, 1, 3]);
        assert!(geometry.is_empty());
    }

    #[test]
    fn oversized_extents_are_rejected() {
        let too_tall = (i32::MAX as usize) + 1;
        assert!(matches!(
            LaunchGeometry::derive(&[1, too_tall, 1, 4]),
            Err(AccelError::Unsupported(_))
        ));
        for shape in [&[1, usize::MAX][..], &[1, 1, 1, usize::MAX - 2][..], &[usize::MAX, 2, 1, 4][..]] {
            assert!(
                matches!(LaunchGeometry::derive(shape), Err(AccelError::Unsupported(_))),
                "{shape:?}"
            );
        }
    }
}
