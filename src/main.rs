use std::{process, sync::Arc};

use folio::{
    application::{
        adapter::{Adapter, GetListParams, GetListResult, GetManyReferenceParams, GetOneParams},
        effects::TracingSink,
        error::{AppError, DataError},
        pagination::{Filter, Pagination, Sort},
        provider::DataProvider,
    },
    config::{self, BackendSettings, PageArgs},
    domain::types::{Identifier, Resource},
    infra::{memory::InMemoryAdapter, rest::RestAdapter, telemetry},
};
use serde::Serialize;
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    telemetry::init(&settings.logging)?;

    let adapter = build_adapter(&settings.backend).await?;
    let provider = DataProvider::new(adapter, Arc::new(TracingSink), &settings.data);

    let result = match cli_args.command {
        config::Command::List(args) => {
            let resource = Resource::from(args.resource);
            let params = list_params(&args.page)?;
            let page = provider.get_list(&resource, params).await?;
            print_page(&resource, page)
        }
        config::Command::Show(args) => {
            let resource = Resource::from(args.resource);
            let id = Identifier::parse(&args.id);
            let record = provider.get_one(&resource, GetOneParams { id }).await?;
            print_json(&record)
        }
        config::Command::References(args) => {
            let resource = Resource::from(args.resource);
            let GetListParams {
                pagination,
                sort,
                filter,
            } = list_params(&args.page)?;
            let params = GetManyReferenceParams {
                target: args.target,
                id: Identifier::parse(&args.id),
                pagination,
                sort,
                filter,
            };
            let page = provider.get_many_reference(&resource, params).await?;
            print_page(&resource, page)
        }
    };

    provider.shutdown().await;
    result
}

async fn build_adapter(backend: &BackendSettings) -> Result<Arc<dyn Adapter>, AppError> {
    match backend {
        BackendSettings::Memory { fixture: Some(path) } => {
            info!(fixture = %path.display(), "using in-memory backend");
            Ok(Arc::new(InMemoryAdapter::from_fixture_file(path).await?))
        }
        BackendSettings::Memory { fixture: None } => {
            info!("using empty in-memory backend");
            Ok(Arc::new(InMemoryAdapter::new()))
        }
        BackendSettings::Rest { base_url } => {
            info!(base_url = %base_url, "using REST backend");
            Ok(Arc::new(RestAdapter::new(base_url.clone())?))
        }
    }
}

fn list_params(args: &PageArgs) -> Result<GetListParams, AppError> {
    let pagination = Pagination::new(args.page, args.per_page).map_err(DataError::from)?;
    let filter = match args.filter.as_deref() {
        Some(raw) => serde_json::from_str::<Filter>(raw).map_err(|err| {
            AppError::Data(DataError::validation(format!("invalid --filter JSON: {err}")))
        })?,
        None => Filter::new(),
    };

    Ok(GetListParams {
        pagination,
        sort: Sort::new(args.sort.clone(), args.order),
        filter,
    })
}

fn print_page(resource: &Resource, page: GetListResult) -> Result<(), AppError> {
    info!(resource = %resource, returned = page.data.len(), total = page.total, "page loaded");
    print_json(&page)
}

fn print_json<T: Serialize>(value: &T) -> Result<(), AppError> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|err| AppError::unexpected(format!("failed to render output: {err}")))?;
    println!("{rendered}");
    Ok(())
}
