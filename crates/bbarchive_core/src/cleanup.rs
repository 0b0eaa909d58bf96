use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

use crate::dom::{
    Document, Handle, Selector, attr, classes, detach, find_all, is_effectively_empty, parent,
    remove_attr, set_attr, set_classes, set_text, tag_name, unwrap,
};
use crate::urls::QueryUrl;

/// Edit, navigation and action widgets that make no sense in an offline copy.
static REMOVED_WIDGETS: LazyLock<Vec<Selector>> = LazyLock::new(|| {
    let pattern = |source: &str| Regex::new(source).expect("static regex");
    let class = |name: &str| Selector::any().with_class(name);
    let id = |name: &str| Selector::any().with_id(name);
    vec![
        class("hideFromQuickLinks"),
        class("edit_controls"),
        class("contextMenuContainer"),
        id("quickLinksLightboxDiv"),
        id("quick_links_wrap"),
        class("global-nav-bar-wrap"),
        id("breadcrumb_controls_id"),
        class("courseArrow"),
        class("actionBarMicro"),
        class("localViewToggle"),
        id("controlPanelPalette"),
        class("eudModule"),
        id("actionbar"),
        class("subActionBar"),
        class("dbThreadFooter"),
        id("copyright"),
        class("taskbuttondiv_wrapper"),
        id("step2"),
        id("step3"),
        class("submitStepBottom"),
        id("iconLegendLinkDiv"),
        class("containerOptions"),
        Selector::any().with_id_pattern(pattern("(?i)showAllButton")),
        Selector::any().with_id_pattern(pattern("(?i)openpaging")),
        Selector::any().with_id_pattern(pattern("(?i)editpaging")),
        Selector::any().with_id_pattern(pattern("(?i)collectAction")),
        Selector::any().with_id_pattern(pattern("(?i)removeListAction")),
        Selector::any().with_id_pattern(pattern("(?i)reorderControls")),
        id("top_list_action_bar"),
        id("bottom_list_action_bar"),
        class("renameCourseToc"),
        class("quickAddPal"),
        class("reorder"),
        class("receiptDate"),
        class("secondaryControl"),
        Selector::tag("h2")
            .with_class("navDivider")
            .with_text_pattern(pattern("Course Management")),
        Selector::tag("li").with_class("sub"),
        Selector::any().with_attr_pattern("onclick", pattern(r"contentList\.toggleDetails")),
        id("threadArea"),
        class("backLink"),
        class("captionText"),
        id("side_nav"),
        class("announcementFilter"),
        Selector::any().with_attr_pattern("onclick", pattern("bb-social-learning-bb_bb60")),
        Selector::tag("div").with_class("streamError"),
    ]
});

/// Links to tools that cannot work offline; the link and any container it
/// leaves empty are removed.
pub const REMOVED_LINK_TARGETS: [&str; 9] = [
    "tool_id=_1842_1",
    "tool_id=_134_1",
    "tool_id=_115_1",
    "tool_id=_118_1",
    "displayEmail",
    "viewExtendedHelp",
    "launchAssessment",
    "groupContentList",
    "groupInventoryList",
];

/// Links whose target is dropped while the link text stays.
pub const DISABLED_LINK_TARGETS: [&str; 2] =
    ["oslt-signUpList-bb_bb60", "eph-ephorus-assignment-bb_bb60"];

const CLASS_REWRITES: [(&str, &[&str]); 9] = [
    ("ineditmode", &[]),
    ("contentBox-edit", &[]),
    ("reorderableModule", &[]),
    ("reorderable", &[]),
    ("dragHandle", &[]),
    ("dndHandle", &[]),
    ("buildList", &["announcementList", "announcementList-read"]),
    ("liItem", &["read"]),
    ("ok", &[]),
];

static CONTENT_WRAPPER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"contentWrapper\.jsp").expect("static regex"));

pub fn cleanup_page(doc: &Document) {
    let mut removed = 0usize;
    for selector in REMOVED_WIDGETS.iter() {
        for node in doc.find_all(selector) {
            detach(&node);
            removed += 1;
        }
    }

    for input in doc.find_all(&Selector::tag("input").with_attr_value("type", "hidden")) {
        unwrap(&input);
    }

    for target in REMOVED_LINK_TARGETS {
        remove_links_to(doc, target);
    }

    for link in doc.find_all(&Selector::tag("a").with_class("sortheader")) {
        remove_attr(&link, "href");
    }
    for target in DISABLED_LINK_TARGETS {
        for link in links_containing(doc, target) {
            remove_attr(&link, "href");
        }
    }

    for (old, replacements) in CLASS_REWRITES {
        replace_class(doc, old, replacements);
    }
    debug!("cleanup removed {removed} widgets");
}

fn links_containing(doc: &Document, target: &str) -> Vec<Handle> {
    doc.find_all(&Selector::tag("a").with_attr("href"))
        .into_iter()
        .filter(|link| attr(link, "href").is_some_and(|href| href.contains(target)))
        .collect()
}

fn remove_links_to(doc: &Document, target: &str) {
    for link in links_containing(doc, target) {
        let mut container = parent(&link);
        detach(&link);
        while let Some(current) = container {
            if is_structural(&current) || !is_effectively_empty(&current) {
                break;
            }
            container = parent(&current);
            detach(&current);
        }
    }
}

fn is_structural(node: &Handle) -> bool {
    matches!(
        tag_name(node).as_deref(),
        None | Some("html") | Some("head") | Some("body")
    )
}

fn replace_class(doc: &Document, old: &str, replacements: &[&str]) {
    for node in doc.find_all(&Selector::any().with_class(old)) {
        let mut updated: Vec<String> = classes(&node)
            .into_iter()
            .filter(|class| class != old)
            .collect();
        updated.extend(replacements.iter().map(|class| class.to_string()));
        set_classes(&node, &updated);
    }
}

/// Point the global navigation tabs at the locally written overview pages.
pub fn replace_navbar(doc: &Document) {
    if doc
        .find_first(&Selector::tag("div").with_id("globalNavPageNavArea"))
        .is_none()
    {
        return;
    }
    match doc.find_first(&Selector::tag("td").with_id("My Blackboard")) {
        Some(tab) => detach(&tab),
        None => warn!("navigation bar has no My Blackboard tab"),
    }
    point_tab_at(doc, "Courses.label", "Courses.html");
    point_tab_at(doc, "Organisations", "Organisations.html");
    if let Some(grades) = point_tab_at(doc, "Support", "Grades.html") {
        match first_within(&grades, &Selector::tag("span")) {
            Some(span) => set_text(&span, "Grades"),
            None => warn!("Support tab has no label span"),
        }
    }
}

fn point_tab_at(doc: &Document, tab_id: &str, page: &str) -> Option<Handle> {
    let Some(tab) = doc.find_first(&Selector::tag("td").with_id(tab_id)) else {
        warn!("navigation bar has no {tab_id} tab");
        return None;
    };
    match first_within(&tab, &Selector::tag("a")) {
        Some(link) => set_attr(&link, "href", page),
        None => warn!("{tab_id} tab has no link"),
    }
    Some(tab)
}

fn first_within(node: &Handle, selector: &Selector) -> Option<Handle> {
    find_all(node, selector).into_iter().next()
}

/// `contentWrapper.jsp` frames only wrap another URL; link straight to it.
pub fn replace_redirects(doc: &Document) {
    let selector = Selector::tag("a").with_attr_pattern("href", CONTENT_WRAPPER.clone());
    for link in doc.find_all(&selector) {
        let Some(href) = attr(&link, "href") else {
            continue;
        };
        match QueryUrl::parse(&href).first("href") {
            Some(target) => set_attr(&link, "href", target),
            None => warn!("contentWrapper link without target: {href}"),
        }
    }
}
