// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use infinote_rs::algorithm::request::RequestKind;

use super::{Site, del, ins};

#[test]
fn test_two_insertions_at_same_position() {
    // The lower-id user wins the left position.
    let mut site1 = Site::new("abcdefghijklmnopqrstuvwxyz", &[1, 2]);
    let mut site2 = Site::new("abcdefghijklmnopqrstuvwxyz", &[1, 2]);

    let r1 = site1.execute(1, ins(1, 4, "X"));
    let r2 = site2.execute(2, ins(2, 4, "Y"));

    site1.receive(r2);
    site2.receive(r1);

    assert_eq!(site1.text(), "abcdXYefghijklmnopqrstuvwxyz");
    assert_eq!(site2.text(), site1.text());
}

#[test]
fn test_delete_across_concurrent_insert() {
    let mut site1 = Site::new("abcdefghij", &[1, 2]);
    let mut site2 = Site::new("abcdefghij", &[1, 2]);

    let r1 = site1.execute(1, del(2, 5));
    let r2 = site2.execute(2, ins(2, 4, "XY"));

    site1.receive(r2);
    site2.receive(r1);

    assert_eq!(site1.text(), "abXYhij");
    assert_eq!(site2.text(), "abXYhij");
}

#[test]
fn test_undo_of_overlapped_delete() {
    let mut site1 = Site::new("Hello, world!", &[1, 2]);
    let mut site2 = Site::new("Hello, world!", &[1, 2]);

    let r1 = site1.execute(1, del(5, 7));
    assert_eq!(site1.text(), "Hello!");
    let r2 = site2.execute(2, ins(2, 7, "brave "));

    site1.receive(r2);
    site2.receive(r1);
    assert_eq!(site1.text(), "Hellobrave !");
    assert_eq!(site2.text(), site1.text());

    let undo = site1.execute(1, RequestKind::Undo);
    assert_eq!(site1.text(), "Hello, brave world!");
    site2.receive(undo);
    assert_eq!(site2.text(), "Hello, brave world!");
}

#[test]
fn test_undo_redo_chain_converges() {
    let mut site1 = Site::new("base", &[1, 2]);
    let mut site2 = Site::new("base", &[1, 2]);

    let r1 = site1.execute(1, ins(1, 4, " one"));
    site2.receive(r1);
    let r2 = site2.execute(2, ins(2, 8, " two"));
    site1.receive(r2);
    assert_eq!(site1.text(), "base one two");

    let undo = site1.execute(1, RequestKind::Undo);
    site2.receive(undo);
    assert_eq!(site1.text(), "base two");
    assert_eq!(site2.text(), "base two");

    let redo = site1.execute(1, RequestKind::Redo);
    site2.receive(redo);
    assert_eq!(site1.text(), "base one two");
    assert_eq!(site2.text(), "base one two");
}

#[test]
fn test_concurrent_pairs_converge() {
    // Convergence over a grid of concurrent pairs with opposite
    // concurrency ids at the two sites.
    let text = "abcdefghij";
    let ops1 = [
        ins(1, 0, "P"),
        ins(1, 4, "QQ"),
        ins(1, 10, "R"),
        del(0, 1),
        del(1, 3),
        del(4, 4),
        del(9, 1),
    ];
    let ops2 = [
        ins(2, 0, "r"),
        ins(2, 4, "ss"),
        ins(2, 10, "t"),
        del(0, 2),
        del(3, 5),
        del(8, 2),
    ];

    for k1 in &ops1 {
        for k2 in &ops2 {
            let mut site1 = Site::new(text, &[1, 2]);
            let mut site2 = Site::new(text, &[1, 2]);

            let r1 = site1.execute(1, k1.clone());
            let r2 = site2.execute(2, k2.clone());
            site1.receive(r2);
            site2.receive(r1);

            assert_eq!(
                site1.text(),
                site2.text(),
                "divergence for {k1:?} / {k2:?}"
            );
        }
    }
}

#[test]
fn test_three_site_triples_converge() {
    // Three sites, three concurrent operations, delivered in different
    // orders; all sites must agree.
    let text = "abcdefghij";
    let kinds = [
        (1u32, ins(1, 3, "X")),
        (2u32, del(2, 4)),
        (3u32, ins(3, 6, "YZ")),
    ];

    let mut sites: Vec<Site> = (0..3).map(|_| Site::new(text, &[1, 2, 3])).collect();
    let requests: Vec<_> = sites
        .iter_mut()
        .zip(kinds.iter())
        .map(|(site, (user, kind))| site.execute(*user, kind.clone()))
        .collect();

    // Site 0 already has request 0, and so on; deliver the other two in
    // site-specific orders.
    sites[0].receive(requests[1].clone());
    sites[0].receive(requests[2].clone());

    sites[1].receive(requests[2].clone());
    sites[1].receive(requests[0].clone());

    sites[2].receive(requests[0].clone());
    sites[2].receive(requests[1].clone());

    assert_eq!(sites[0].text(), sites[1].text());
    assert_eq!(sites[1].text(), sites[2].text());
}

#[test]
fn test_sequence_of_edits_interleaved() {
    // A longer two-site editing session with acknowledgement cycles.
    let mut site1 = Site::new("", &[1, 2]);
    let mut site2 = Site::new("", &[1, 2]);

    let a = site1.execute(1, ins(1, 0, "hello"));
    site2.receive(a);
    let b = site2.execute(2, ins(2, 5, " world"));
    site1.receive(b);

    let c = site1.execute(1, del(0, 1));
    let d = site2.execute(2, ins(2, 11, "!"));
    site1.receive(d);
    site2.receive(c);

    assert_eq!(site1.text(), "ello world!");
    assert_eq!(site2.text(), site1.text());

    // Vector components equal per-author log counts on both sites.
    for site in [&site1, &site2] {
        for user in [1, 2] {
            assert_eq!(
                site.algorithm.current_vector().get(user),
                site.algorithm.log().count(user),
            );
        }
    }
}
