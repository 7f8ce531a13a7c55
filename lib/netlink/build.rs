fn main() {
    // Same two shared libraries metalos/lib/netlink links against: libnl-3
    // for the generic cache/socket plumbing, libnl-route-3 for the rtnl_*
    // link/address/route/nexthop families used here.
    pkg_config::probe_library("libnl-3.0").expect("libnl-3.0 development package not found");
    pkg_config::probe_library("libnl-route-3.0")
        .expect("libnl-route-3.0 development package not found");
}
