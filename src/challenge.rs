use std::collections::HashSet;

/// Static blacklist/whitelist membership test over sender addresses.
#[derive(Debug, Clone, Default)]
pub struct SenderChallenge {
    pub blacklist: HashSet<String>,
    pub whitelist: HashSet<String>,
    pub whitelist_mode: bool,
}

impl SenderChallenge {
    /// Returns whether `sender` may send. The blacklist always wins over the
    /// whitelist; the whitelist only restricts when whitelist mode is on.
    pub fn challenge(&self, sender: &str) -> bool {
        let sender = sender.to_lowercase();

        if self.blacklist.contains(&sender) {
            log::debug!("{sender} is blacklisted");
            return false;
        }

        if self.whitelist.contains(&sender) {
            return true;
        }

        !self.whitelist_mode
    }
}
