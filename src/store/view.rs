//! View-model for the open channel

use super::domain::DomainStore;
use super::types::{Channel, ChannelId};
use crate::command::{Command, Execution};
use crate::model::{when, when2, CellProperty, ChangeBus, DerivedProperty, Property, PropertyPath, When};
use crate::reactive::Subscription;
use std::fmt;
use std::sync::Arc;

/// State behind a channel header.
///
/// Selecting a channel swaps the channel cell; `title` and `summary` follow
/// whichever cell is current, including pushes into it.
pub struct ChannelViewModel {
    bus: ChangeBus,
    selected: Property<Option<ChannelId>>,
    channel: CellProperty<Channel>,
    title: DerivedProperty<String>,
    summary: When<String>,
    refresh: Command<Option<Channel>>,
    _follow_selection: Subscription,
}

impl ChannelViewModel {
    pub fn new(store: Arc<DomainStore>) -> Self {
        let bus = ChangeBus::new();
        let selected = Property::new(&bus, "selected", None);
        let channel = CellProperty::new(&bus, "channel");

        let follow_selection = {
            let (store, channel) = (Arc::clone(&store), channel.clone());
            selected.observe_changes(move |id: &Option<ChannelId>| {
                channel.set_cell(id.as_ref().map(|id| store.channel(id)));
            })
        };

        let open: PropertyPath<CellProperty<Channel>, Channel> =
            PropertyPath::new(|channel: &CellProperty<Channel>| channel.clone());
        let title_path = open.map(Channel::display_title);
        let members_path = open.map(|c: &Channel| c.members.as_ref().map_or(0, Vec::len));

        let title = DerivedProperty::from_observable(&bus, "title", when(&channel, &title_path));
        let summary = when2(&channel, &title_path, &members_path, |title: &String, members: &usize| match *members {
            1 => format!("{title} · 1 member"),
            n => format!("{title} · {n} members"),
        });

        let refresh = {
            let (store, selected) = (Arc::clone(&store), selected.clone());
            Command::from_async("refresh_channel", None, move || {
                let (store, selected) = (Arc::clone(&store), selected.clone());
                async move {
                    match selected.get() {
                        Some(id) => store.refresh_channel(&id).await.map(Some),
                        None => Ok(None),
                    }
                }
            })
        };

        Self {
            bus,
            selected,
            channel,
            title,
            summary,
            refresh,
            _follow_selection: follow_selection,
        }
    }

    pub fn bus(&self) -> &ChangeBus {
        &self.bus
    }

    pub fn select(&self, id: Option<ChannelId>) {
        self.selected.set(id);
    }

    pub fn selected(&self) -> &Property<Option<ChannelId>> {
        &self.selected
    }

    pub fn channel(&self) -> &CellProperty<Channel> {
        &self.channel
    }

    pub fn title(&self) -> &DerivedProperty<String> {
        &self.title
    }

    /// Title plus member count
    pub fn summary(&self) -> &When<String> {
        &self.summary
    }

    /// Refetch the selected channel. Concurrent calls share one fetch.
    pub fn refresh(&self) -> Execution<Option<Channel>> {
        self.refresh.execute()
    }

    pub fn refresh_command(&self) -> &Command<Option<Channel>> {
        &self.refresh
    }
}

impl fmt::Debug for ChannelViewModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelViewModel")
            .field("selected", &self.selected.get())
            .field("title", &self.title.get())
            .finish()
    }
}
