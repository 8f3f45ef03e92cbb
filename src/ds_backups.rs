use rand::Rng;

use crate::ds_interface::NodeId;

/// Backups nobody has engaged yet, shared by every node running a backup
/// search. Drawn backups leave the pool; declined ones come back.
#[derive(Clone, Debug, Default)]
pub struct BackupPool {
    available: Vec<NodeId>,
}

impl BackupPool {
    pub fn new(backups: Vec<NodeId>) -> Self {
        Self { available: backups }
    }

    /// Removes up to `count` random backups from the pool.
    pub fn draw<R: Rng>(&mut self, count: usize, rng: &mut R) -> Vec<NodeId> {
        let count = count.min(self.available.len());
        let mut drawn = Vec::with_capacity(count);
        for _ in 0..count {
            let index = rng.gen_range(0..self.available.len());
            drawn.push(self.available.swap_remove(index));
        }
        drawn
    }

    pub fn release(&mut self, backup: NodeId) {
        if !self.available.contains(&backup) {
            self.available.push(backup);
        }
    }

    pub fn len(&self) -> usize {
        self.available.len()
    }

    pub fn is_empty(&self) -> bool {
        self.available.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_draw_shrinks_pool() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut pool = BackupPool::new((100..110).collect());

        let drawn = pool.draw(4, &mut rng);

        assert_eq!(drawn.len(), 4);
        assert_eq!(pool.len(), 6);
        for id in &drawn {
            assert!((100..110).contains(id));
        }

        let rest = pool.draw(10, &mut rng);
        assert_eq!(rest.len(), 6);
        assert!(pool.is_empty());
        assert!(pool.draw(1, &mut rng).is_empty());
    }

    #[test]
    fn test_release_returns_once() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut pool = BackupPool::new(vec![1, 2]);
        let drawn = pool.draw(1, &mut rng);

        pool.release(drawn[0]);
        pool.release(drawn[0]);

        assert_eq!(pool.len(), 2);
    }
}
