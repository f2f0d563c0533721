use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    load_settings, Affordance, DisplayState, GridView, LazyTree, PagedFilterGrid, QueryState,
    RestBackend, Settings, VisibleRow,
};
use shared::{
    domain::{LevelType, NodeId, SortDirection},
    source::{DataSource, HierarchySource, MissingDataSource, MissingHierarchySource},
};
use storage::{
    seed::{seed_demo, HierarchyShape},
    Storage,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Cli {
    /// Overrides `database_url` from reach.toml / the environment.
    #[arg(long)]
    database_url: Option<String>,
    #[arg(long)]
    owner_id: Option<String>,
    /// Talk to the hosted backend instead of the local SQLite mirror.
    #[arg(long)]
    remote: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Seed {
        #[arg(long, default_value_t = 120)]
        customers: usize,
        #[arg(long, default_value_t = 2)]
        branches: usize,
    },
    Page {
        #[arg(long)]
        search: Option<String>,
        /// `facet=value`, repeatable.
        #[arg(long = "filter")]
        filters: Vec<String>,
        #[arg(long)]
        sort: Option<String>,
        #[arg(long)]
        desc: bool,
        #[arg(long, default_value_t = 0)]
        page: usize,
        #[arg(long)]
        page_size: Option<usize>,
    },
    Tree {
        /// Node ids to expand, outermost first.
        #[arg(long = "expand")]
        expand: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut settings = load_settings();
    if let Some(database_url) = cli.database_url.clone() {
        settings.database_url = database_url;
    }
    if let Some(owner_id) = cli.owner_id.clone() {
        settings.owner_id = owner_id;
    }

    match cli.command {
        Command::Seed {
            customers,
            branches,
        } => {
            let storage = Storage::new(&settings.database_url).await?;
            let shape = HierarchyShape {
                branches,
                ..HierarchyShape::default()
            };
            let summary = seed_demo(&storage, &settings.owner_id(), customers, shape).await?;
            println!(
                "seeded customers={} report_nodes={} into {}",
                summary.customers, summary.report_nodes, settings.database_url
            );
        }
        Command::Page {
            search,
            filters,
            sort,
            desc,
            page,
            page_size,
        } => {
            let (data, _) = sources(&settings, cli.remote).await?;
            let mut config = settings.grid_config();
            if let Some(size) = page_size {
                config.page_size = size.max(1);
            }
            let mut query = QueryState::new(
                sort.unwrap_or_else(|| settings.sort_key.clone()),
                config.page_size,
            );
            for filter in &filters {
                let (facet, value) = filter
                    .split_once('=')
                    .ok_or_else(|| anyhow!("filter '{filter}' must look like facet=value"))?;
                query = query.with_filter(facet, value);
            }
            if let Some(search) = search {
                query = query.with_search(search);
            }
            if desc {
                query.sort_direction = SortDirection::Descending;
            }
            // An index past the end is clamped by the grid once the total is known.
            let query = query.with_page(page, None);

            let grid = PagedFilterGrid::new(data, config);
            grid.load_query(query).await;
            grid.wait_idle().await;

            print_page(&grid.view().await)?;
        }
        Command::Tree { expand } => {
            let (_, hierarchy) = sources(&settings, cli.remote).await?;
            let tree = LazyTree::load(hierarchy, settings.owner_id()).await?;
            for raw in &expand {
                let id = NodeId::new(raw.as_str());
                let mut key = None;
                for level in LevelType::ALL {
                    key = tree.find_by_id(level, &id).await;
                    if key.is_some() {
                        break;
                    }
                }
                let key = key.with_context(|| format!("node {raw} is not loaded"))?;
                tree.toggle_expand(key).await?;
            }
            for row in tree.visible_rows().await {
                print_tree_row(&row);
            }
        }
    }

    Ok(())
}

async fn sources(
    settings: &Settings,
    remote: bool,
) -> Result<(Arc<dyn DataSource>, Arc<dyn HierarchySource>)> {
    if remote {
        let Some(base_url) = settings.backend_url.as_deref() else {
            warn!("tools: --remote without backend_url in reach.toml or REACH_BACKEND_URL");
            let data: Arc<dyn DataSource> = Arc::new(MissingDataSource);
            let hierarchy: Arc<dyn HierarchySource> = Arc::new(MissingHierarchySource);
            return Ok((data, hierarchy));
        };
        info!(%base_url, "tools: using hosted backend");
        let backend = Arc::new(RestBackend::new(base_url, settings.api_key.clone())?);
        let data: Arc<dyn DataSource> = backend.clone();
        let hierarchy: Arc<dyn HierarchySource> = backend;
        return Ok((data, hierarchy));
    }
    info!(database_url = %settings.database_url, "tools: using sqlite mirror");
    let storage = Arc::new(Storage::new(&settings.database_url).await?);
    let data: Arc<dyn DataSource> = storage.clone();
    let hierarchy: Arc<dyn HierarchySource> = storage;
    Ok((data, hierarchy))
}

fn print_page(view: &GridView) -> Result<()> {
    if let Some(error) = &view.error {
        bail!("page fetch failed: {error}");
    }
    match view.display_state {
        DisplayState::Loading => bail!("no page was loaded"),
        DisplayState::Empty => println!("no customers yet"),
        DisplayState::NoMatches => println!("no customers match the current search and filters"),
        DisplayState::Rows => {}
    }
    let Some(page) = &view.page else {
        return Ok(());
    };
    for row in &page.rows {
        println!(
            "{:<8} {:<24} {:<8} {:<10} {:<7} {:>5} {:>9}",
            row.identity().map(|id| id.as_str()).unwrap_or("-"),
            row.name.as_deref().unwrap_or("-"),
            row.region.as_deref().unwrap_or("-"),
            row.plan.as_deref().unwrap_or("-"),
            row.status.as_deref().unwrap_or("-"),
            row.fleet_size.map(|n| n.to_string()).unwrap_or_default(),
            row.monthly_total.map(|n| format!("{n:.2}")).unwrap_or_default(),
        );
    }
    println!(
        "page {} of {} ({} customers)",
        view.query.page_index + 1,
        view.page_count.unwrap_or(1),
        page.total_count
    );
    Ok(())
}

fn print_tree_row(row: &VisibleRow) {
    let marker = match (row.affordance, row.expanded) {
        (Affordance::Leaf, _) => " ",
        (Affordance::Loading, _) => "~",
        (Affordance::Expandable, true) => "-",
        (Affordance::Expandable, false) => "+",
    };
    let metrics = &row.node.metrics;
    println!(
        "{indent}{marker} {name} [{level} {id}] visits={visits} completed={completed} km={km:.1}",
        indent = "  ".repeat(row.depth),
        name = row.node.name,
        level = row.node.level,
        id = row.node.id,
        visits = metrics.visits,
        completed = metrics.completed_visits,
        km = metrics.distance_km,
    );
}
