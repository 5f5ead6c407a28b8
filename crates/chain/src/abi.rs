use alloy::sol;

// ─── Honey Jar / Honeycomb (ERC-721) ────────────────────────────────────────
sol! {
    #[allow(missing_docs)]
    #[derive(Debug, PartialEq, Eq)]
    contract HoneyJar {
        event Transfer(address indexed from, address indexed to, uint256 indexed tokenId);
        event Approval(address indexed owner, address indexed approved, uint256 indexed tokenId);
    }
}

// ─── Moneycomb vault ────────────────────────────────────────────────────────
sol! {
    #[allow(missing_docs)]
    #[derive(Debug, PartialEq, Eq)]
    contract MoneycombVault {
        event AccountOpened(address indexed user, uint256 accountIndex, uint256 honeycombId);
        event HJBurned(address indexed user, uint256 accountIndex, uint8 hjGen);
        event SharesMinted(address indexed user, uint256 accountIndex, uint256 shares);
        event RewardClaimed(address indexed user, uint256 reward);
        event AccountClosed(address indexed user, uint256 accountIndex, uint256 honeycombId);
    }
}
